//! 命令词法分析
//!
//! 文本先切分为 `Token`，再由 `parse` 组装成 `Arg`：位置值、`--name[=value]`
//! 与 `-xyz[=value]`。非文本消息段直接成为一个 `Segment` 元素。

use super::error::LexError;
use crate::message::Segment;

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Word(String),
    /// `-xvf` 中的 `xvf`
    ShortOption(String),
    /// `--name` 中的 `name`
    LongOption(String),
    Quoted(String),
    /// 紧跟选项名的 `=`
    Separator,
    Segment(Segment),
    Eof,
}

/// 位置值
#[derive(Debug, Clone, PartialEq)]
pub enum Element {
    Word(String),
    Quoted(String),
    Segment(Segment),
}

impl Element {
    /// 文本内容，消息段返回 None
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Word(s) | Self::Quoted(s) => Some(s),
            Self::Segment(_) => None,
        }
    }

    pub fn summary(&self) -> String {
        match self {
            Self::Word(s) | Self::Quoted(s) => s.clone(),
            Self::Segment(seg) => seg.summary(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Element(Element),
    Long { name: String, value: Option<Element> },
    Short { flags: String, value: Option<Element> },
}

impl Arg {
    pub fn word(&self) -> Option<&str> {
        match self {
            Self::Element(Element::Word(w)) => Some(w),
            _ => None,
        }
    }
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    /// 在整条消息中的起始偏移，用于报错位置
    base: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(text: &str, base: usize) -> Self {
        Self {
            chars: text.chars().collect(),
            pos: 0,
            base,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn at_boundary(&self) -> bool {
        self.peek().is_none_or(char::is_whitespace)
    }

    fn run(mut self) -> Result<Vec<Token>, LexError> {
        loop {
            while self.peek().is_some_and(char::is_whitespace) {
                self.pos += 1;
            }
            let Some(c) = self.peek() else { break };
            match c {
                '"' | '\'' => {
                    let quoted = self.read_quoted(c)?;
                    self.tokens.push(Token::Quoted(quoted));
                }
                '-' if self.peek_at(1) == Some('-') => self.read_long(),
                '-' => self.read_short(),
                _ => {
                    let word = self.read_until(|ch| ch.is_whitespace());
                    self.tokens.push(Token::Word(word));
                }
            }
        }
        Ok(self.tokens)
    }

    fn read_until(&mut self, stop: impl Fn(char) -> bool) -> String {
        let start = self.pos;
        while self.peek().is_some_and(|c| !stop(c)) {
            self.pos += 1;
        }
        self.chars[start..self.pos].iter().collect()
    }

    fn read_quoted(&mut self, quote: char) -> Result<String, LexError> {
        let start = self.base + self.pos;
        self.pos += 1;
        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(LexError::QuoteMismatch { position: start });
            };
            self.pos += 1;
            if c == quote {
                return Ok(out);
            }
            if c != '\\' {
                out.push(c);
                continue;
            }
            let Some(next) = self.peek() else {
                return Err(LexError::QuoteMismatch { position: start });
            };
            let escaped = match next {
                '"' => '"',
                '\'' => '\'',
                '\\' => '\\',
                '/' => '/',
                'n' => '\n',
                't' => '\t',
                'r' => '\r',
                other => {
                    return Err(LexError::InvalidEscape {
                        position: self.base + self.pos - 1,
                        sequence: format!("\\{other}"),
                    });
                }
            };
            out.push(escaped);
            self.pos += 1;
        }
    }

    /// `=` 之后若直接是空白，补一个空值
    fn read_separator(&mut self) {
        if self.peek() == Some('=') {
            self.pos += 1;
            self.tokens.push(Token::Separator);
            if self.at_boundary() {
                self.tokens.push(Token::Word(String::new()));
            }
        }
    }

    fn read_long(&mut self) {
        let start = self.pos;
        self.pos += 2;
        let name = self.read_until(|c| c.is_whitespace() || c == '=');
        if name.is_empty() {
            // 单独的 `--` 或 `--=...` 按普通词处理
            self.pos = start;
            let word = self.read_until(char::is_whitespace);
            self.tokens.push(Token::Word(word));
            return;
        }
        self.tokens.push(Token::LongOption(name));
        self.read_separator();
    }

    fn read_short(&mut self) {
        let start = self.pos;
        self.pos += 1;
        let flags = self.read_until(|c| c.is_whitespace() || c == '=');
        let is_flags = flags.chars().next().is_some_and(|c| c.is_ascii_alphabetic())
            && flags.chars().all(|c| c.is_ascii_alphanumeric());
        if !is_flags {
            // `-5`、`-` 等视为普通词
            self.pos = start;
            let word = self.read_until(char::is_whitespace);
            self.tokens.push(Token::Word(word));
            return;
        }
        self.tokens.push(Token::ShortOption(flags));
        self.read_separator();
    }
}

/// 切分一段纯文本，结尾附带 `Eof`
pub fn tokenize(text: &str) -> Result<Vec<Token>, LexError> {
    let mut tokens = Lexer::new(text, 0).run()?;
    tokens.push(Token::Eof);
    Ok(tokens)
}

/// 切分消息段数组
///
/// 开头的引用回复段会被跳过；文本段逐个切分，其余消息段各成为一个 token。
pub fn tokenize_message(segments: &[Segment]) -> Result<Vec<Token>, LexError> {
    let mut tokens = Vec::new();
    let mut offset = 0;
    let body = segments
        .iter()
        .skip_while(|seg| seg.kind == "reply" || seg.as_text().is_some_and(|t| t.trim().is_empty()));

    for seg in body {
        match seg.as_text() {
            Some(text) => {
                tokens.extend(Lexer::new(text, offset).run()?);
                offset += text.chars().count();
            }
            None if seg.is_text() => {}
            None => tokens.push(Token::Segment(seg.clone())),
        }
    }
    tokens.push(Token::Eof);
    Ok(tokens)
}

/// 把 token 流组装为参数序列
pub fn parse(tokens: Vec<Token>) -> Vec<Arg> {
    let mut args = Vec::new();
    let mut iter = tokens.into_iter().peekable();

    let take_value = |iter: &mut std::iter::Peekable<std::vec::IntoIter<Token>>| -> Option<Element> {
        if iter.peek() != Some(&Token::Separator) {
            return None;
        }
        iter.next();
        let value = match iter.peek() {
            Some(Token::Word(_) | Token::Quoted(_) | Token::Segment(_)) => iter.next(),
            _ => None,
        };
        Some(match value {
            Some(Token::Word(w)) => Element::Word(w),
            Some(Token::Quoted(q)) => Element::Quoted(q),
            Some(Token::Segment(s)) => Element::Segment(s),
            _ => Element::Word(String::new()),
        })
    };

    while let Some(token) = iter.next() {
        match token {
            Token::Word(w) => args.push(Arg::Element(Element::Word(w))),
            Token::Quoted(q) => args.push(Arg::Element(Element::Quoted(q))),
            Token::Segment(s) => args.push(Arg::Element(Element::Segment(s))),
            Token::LongOption(name) => {
                let value = take_value(&mut iter);
                args.push(Arg::Long { name, value });
            }
            Token::ShortOption(flags) => {
                let value = take_value(&mut iter);
                args.push(Arg::Short { flags, value });
            }
            // 游离的分隔符只会出现在手工构造的 token 流中
            Token::Separator => args.push(Arg::Element(Element::Word("=".into()))),
            Token::Eof => break,
        }
    }
    args
}

/// 切分并组装消息
pub fn parse_message(segments: &[Segment]) -> Result<Vec<Arg>, LexError> {
    tokenize_message(segments).map(parse)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Map, Value};

    fn words(text: &str) -> Vec<Token> {
        tokenize(text).unwrap()
    }

    #[test]
    fn quoted_text_is_one_token() {
        assert_eq!(
            words(r#"say "hello world" 'a b'"#),
            vec![
                Token::Word("say".into()),
                Token::Quoted("hello world".into()),
                Token::Quoted("a b".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn escapes_inside_quotes() {
        assert_eq!(
            words(r#""a\"b\\c\nd\/""#),
            vec![Token::Quoted("a\"b\\c\nd/".into()), Token::Eof]
        );
        assert_eq!(
            tokenize(r#""bad \q""#),
            Err(LexError::InvalidEscape {
                position: 5,
                sequence: "\\q".into()
            })
        );
    }

    #[test]
    fn unterminated_quote_reports_start() {
        assert_eq!(
            tokenize(r#"echo "oops"#),
            Err(LexError::QuoteMismatch { position: 5 })
        );
    }

    #[test]
    fn options_and_negative_numbers() {
        assert_eq!(
            words("calc -5 -xvf --name=value --flag - --"),
            vec![
                Token::Word("calc".into()),
                Token::Word("-5".into()),
                Token::ShortOption("xvf".into()),
                Token::LongOption("name".into()),
                Token::Separator,
                Token::Word("value".into()),
                Token::LongOption("flag".into()),
                Token::Word("-".into()),
                Token::Word("--".into()),
                Token::Eof,
            ]
        );
    }

    #[test]
    fn parse_attaches_separator_values() {
        let args = parse(words(r#"cmd --b=y --c= --d "q v" -n=3"#));
        assert_eq!(
            args,
            vec![
                Arg::Element(Element::Word("cmd".into())),
                Arg::Long {
                    name: "b".into(),
                    value: Some(Element::Word("y".into()))
                },
                Arg::Long {
                    name: "c".into(),
                    value: Some(Element::Word(String::new()))
                },
                Arg::Long {
                    name: "d".into(),
                    value: None
                },
                Arg::Element(Element::Quoted("q v".into())),
                Arg::Short {
                    flags: "n".into(),
                    value: Some(Element::Word("3".into()))
                },
            ]
        );
    }

    #[test]
    fn message_segments_become_elements() {
        let mut at = Map::new();
        at.insert("qq".into(), Value::from("10001"));
        let mut reply = Map::new();
        reply.insert("id".into(), Value::from("7"));
        let segments = vec![
            Segment::new("reply", reply),
            Segment::text("/kick "),
            Segment::new("at", at.clone()),
            Segment::text(" --reason=spam"),
        ];

        let args = parse_message(&segments).unwrap();
        assert_eq!(args.len(), 3);
        assert_eq!(args[0].word(), Some("/kick"));
        assert_eq!(args[1], Arg::Element(Element::Segment(Segment::new("at", at))));
        assert!(matches!(&args[2], Arg::Long { name, .. } if name == "reason"));
    }
}
