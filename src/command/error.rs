use super::spec::CommandSpec;
use super::help::HelpGenerator;
use std::fmt;
use thiserror::Error;

/// 词法错误
#[derive(Debug, Clone, Error, PartialEq)]
pub enum LexError {
    #[error("引号不匹配：位置 {position} 处的引号没有闭合")]
    QuoteMismatch { position: usize },

    #[error("无效的转义序列 '{sequence}'（位置 {position}）")]
    InvalidEscape { position: usize, sequence: String },
}

/// 注册期错误，一次性列出某个命令的全部问题
#[derive(Debug, Clone, PartialEq)]
pub struct RegistrationError {
    pub command: String,
    pub problems: Vec<String>,
}

impl RegistrationError {
    pub fn new(command: impl Into<String>, problems: Vec<String>) -> Self {
        Self {
            command: command.into(),
            problems,
        }
    }

    pub fn single(command: impl Into<String>, problem: impl Into<String>) -> Self {
        Self::new(command, vec![problem.into()])
    }
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "命令 '{}' 注册失败，共 {} 个问题",
            self.command,
            self.problems.len()
        )?;
        for (i, p) in self.problems.iter().enumerate() {
            write!(f, "\n  {}. {}", i + 1, p)?;
        }
        Ok(())
    }
}

impl std::error::Error for RegistrationError {}

/// 单个候选类型的转换失败原因
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionAttempt {
    pub type_name: String,
    pub reason: String,
}

/// 绑定期错误，会格式化后回复给用户
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ArgumentError {
    #[error("缺少参数 '{param}'：需要 {expected} 个，实际传入 {actual} 个")]
    Missing {
        param: String,
        expected: usize,
        actual: usize,
    },

    #[error("参数过多：最多 {expected} 个，实际传入 {actual} 个")]
    TooMany { expected: usize, actual: usize },

    #[error("参数 '{param}' 的值 '{value}' 无法转换: {}", describe_attempts(.attempts))]
    Conversion {
        param: String,
        value: String,
        attempts: Vec<ConversionAttempt>,
    },

    #[error("选项 '{0}' 无效")]
    UnknownOption(String),

    #[error("参数 '{0}' 无效")]
    UnknownParam(String),

    #[error("参数 '{param}' 缺少取值")]
    MissingValue { param: String },

    #[error("参数 '{param}' 的值 '{value}' 不在可选范围 [{}] 内", join_choices(.choices))]
    InvalidChoice {
        param: String,
        value: String,
        choices: Vec<String>,
    },

    #[error("选项组 '{group}' 只能选择一个：'{first}' 与 '{second}' 冲突")]
    ConflictingChoices {
        group: String,
        first: String,
        second: String,
    },

    #[error("{0}")]
    Lex(#[from] LexError),
}

fn join_choices(choices: &[String]) -> String {
    choices.join(", ")
}

fn describe_attempts(attempts: &[ConversionAttempt]) -> String {
    attempts
        .iter()
        .map(|a| format!("{} ({})", a.type_name, a.reason))
        .collect::<Vec<_>>()
        .join("；")
}

impl ArgumentError {
    /// 多类型转换时是否每种类型都尝试过
    pub fn is_multi_type(&self) -> bool {
        matches!(self, Self::Conversion { attempts, .. } if attempts.len() > 1)
    }
}

/// 未找到命令，附带相近的候选
#[derive(Debug, Clone, Error, PartialEq)]
#[error("未找到命令 '{input}'")]
pub struct CommandNotFound {
    pub input: String,
    pub suggestions: Vec<String>,
}

/// 把错误渲染成面向聊天用户的提示
pub struct ErrorFormatter;

impl ErrorFormatter {
    pub fn not_found(err: &CommandNotFound, prefix: &str) -> String {
        let mut out = format!("❌ {err}");
        if !err.suggestions.is_empty() {
            let list: Vec<String> = err
                .suggestions
                .iter()
                .map(|s| format!("{prefix}{s}"))
                .collect();
            out.push_str(&format!("\n💡 你是不是想找: {}", list.join(", ")));
        }
        out
    }

    pub fn argument(spec: &CommandSpec, err: &ArgumentError, prefix: &str) -> String {
        let mut out = format!("❌ {err}");
        if let ArgumentError::Conversion { attempts, .. } = err
            && attempts.len() > 1
        {
            out.push_str("\n已尝试的类型:");
            for a in attempts {
                out.push_str(&format!("\n  - {}: {}", a.type_name, a.reason));
            }
        }
        out.push_str(&format!(
            "\n📖 用法: {}",
            HelpGenerator::usage(spec, prefix)
        ));
        out
    }

    pub fn lex(err: &LexError) -> String {
        let hint = match err {
            LexError::QuoteMismatch { .. } => "请检查引号是否成对出现",
            LexError::InvalidEscape { .. } => "支持的转义: \\\" \\' \\\\ \\n \\t \\r \\/",
        };
        format!("❌ {err}\n💡 {hint}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registration_error_lists_every_problem() {
        let err = RegistrationError::new("cmd", vec!["a".into(), "b".into()]);
        let text = err.to_string();
        assert!(text.contains("共 2 个问题"));
        assert!(text.contains("1. a"));
        assert!(text.contains("2. b"));
    }

    #[test]
    fn conversion_error_names_each_type() {
        let err = ArgumentError::Conversion {
            param: "n".into(),
            value: "x".into(),
            attempts: vec![
                ConversionAttempt {
                    type_name: "int".into(),
                    reason: "invalid digit".into(),
                },
                ConversionAttempt {
                    type_name: "float".into(),
                    reason: "invalid float literal".into(),
                },
            ],
        };
        let text = err.to_string();
        assert!(text.contains("int (invalid digit)"));
        assert!(text.contains("float (invalid float literal)"));
        assert!(err.is_multi_type());
    }

    #[test]
    fn not_found_renders_suggestions_with_prefix() {
        let err = CommandNotFound {
            input: "pnig".into(),
            suggestions: vec!["ping".into()],
        };
        let text = ErrorFormatter::not_found(&err, "/");
        assert!(text.contains("/ping"));
    }
}
