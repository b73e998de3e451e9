//! 参数绑定
//!
//! 命令路径之后的参数从左到右处理：`--name` 先匹配命名参数，再匹配布尔选项，
//! 最后匹配选项组的取值；其余位置值依次填入尚未赋值的位置参数。

use super::error::{ArgumentError, ConversionAttempt};
use super::lexer::{Arg, Element};
use super::spec::{Annotation, ArgValue, BoundGroup, CommandSpec, FromArg, NamedTarget};
use std::collections::HashMap;

/// 绑定结果，按处理函数参数顺序排列
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundArgs {
    values: Vec<(String, ArgValue)>,
}

impl BoundArgs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get<T: FromArg>(&self, name: &str) -> Option<T> {
        self.value(name).and_then(T::from_arg)
    }

    pub fn value(&self, name: &str) -> Option<&ArgValue> {
        self.values.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.value(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ArgValue)> {
        self.values.iter().map(|(n, v)| (n.as_str(), v))
    }
}

pub struct Binder;

impl Binder {
    pub fn bind(spec: &CommandSpec, args: &[Arg]) -> Result<BoundArgs, ArgumentError> {
        let mut state = BindState::default();
        let mut i = 0;

        while i < args.len() {
            match &args[i] {
                Arg::Element(el) => state.positional.push(el.clone()),
                Arg::Long { name, value } => {
                    if let Some(target) = spec.find_named_target(name) {
                        let el = match value {
                            Some(v) => v.clone(),
                            None => match args.get(i + 1) {
                                Some(Arg::Element(next)) => {
                                    i += 1;
                                    next.clone()
                                }
                                _ => {
                                    return Err(ArgumentError::MissingValue { param: name.clone() });
                                }
                            },
                        };
                        state.assign(target, &el)?;
                    } else if let Some(opt) = spec.find_option_long(name) {
                        let flag = option_value(&opt.name, value.as_ref())?;
                        state.options.insert(opt.name.clone(), flag);
                    } else if let Some(group) = spec.find_group_by_choice(name)
                        && value.is_none()
                    {
                        state.choose(group, name)?;
                    } else {
                        return Err(ArgumentError::UnknownOption(format!("--{name}")));
                    }
                }
                Arg::Short { flags, value: Some(v) } => {
                    let mut chars = flags.chars();
                    let (Some(c), None) = (chars.next(), chars.next()) else {
                        return Err(ArgumentError::UnknownOption(format!("-{flags}")));
                    };
                    if let Some(target) = spec.find_named_target(flags) {
                        state.assign(target, v)?;
                    } else if let Some(opt) = spec.find_option_short(c) {
                        let flag = option_value(&opt.name, Some(v))?;
                        state.options.insert(opt.name.clone(), flag);
                    } else {
                        return Err(ArgumentError::UnknownOption(format!("-{flags}")));
                    }
                }
                Arg::Short { flags, value: None } => {
                    for c in flags.chars() {
                        if let Some(opt) = spec.find_option_short(c) {
                            state.options.insert(opt.name.clone(), true);
                        } else if let Some(group) = spec.find_group_by_choice(&c.to_string()) {
                            state.choose(group, &c.to_string())?;
                        } else {
                            return Err(ArgumentError::UnknownOption(format!("-{c}")));
                        }
                    }
                }
            }
            i += 1;
        }

        state.finish(spec)
    }
}

#[derive(Default)]
struct BindState {
    positional: Vec<Element>,
    /// 按名称赋值的参数（位置参数或命名参数）
    named: HashMap<String, ArgValue>,
    options: HashMap<String, bool>,
    /// 组名 -> 选中的取值
    chosen: HashMap<String, String>,
}

impl BindState {
    fn assign(&mut self, target: NamedTarget<'_>, el: &Element) -> Result<(), ArgumentError> {
        match target {
            NamedTarget::Positional(p) => {
                let value = convert(&p.name, el, &p.annotation)?;
                self.named.insert(p.name.clone(), value);
            }
            NamedTarget::Param(p) => {
                let value = convert(&p.spec.name, el, &p.annotation)?;
                check_choices(&p.spec.name, &p.spec.choices, &value)?;
                self.named.insert(p.spec.name.clone(), value);
            }
        }
        Ok(())
    }

    fn choose(&mut self, group: &BoundGroup, choice: &str) -> Result<(), ArgumentError> {
        match self.chosen.get(&group.spec.name) {
            Some(first) if first != choice => Err(ArgumentError::ConflictingChoices {
                group: group.spec.name.clone(),
                first: first.clone(),
                second: choice.to_string(),
            }),
            _ => {
                self.chosen.insert(group.spec.name.clone(), choice.to_string());
                Ok(())
            }
        }
    }

    fn finish(mut self, spec: &CommandSpec) -> Result<BoundArgs, ArgumentError> {
        let mut out: Vec<(usize, String, ArgValue)> = Vec::new();

        let open: Vec<_> = spec
            .positionals
            .iter()
            .filter(|p| !self.named.contains_key(&p.name))
            .collect();
        if self.positional.len() > open.len() {
            return Err(ArgumentError::TooMany {
                expected: open.len(),
                actual: self.positional.len(),
            });
        }

        let required = open.iter().filter(|p| p.default.is_none()).count();
        let supplied = self.positional.len();
        let mut values = std::mem::take(&mut self.positional).into_iter();
        for p in &spec.positionals {
            if let Some(v) = self.named.remove(&p.name) {
                out.push((p.index, p.name.clone(), v));
                continue;
            }
            let value = match (values.next(), &p.default) {
                (Some(el), _) => convert(&p.name, &el, &p.annotation)?,
                (None, Some(d)) => d.clone(),
                (None, None) => {
                    return Err(ArgumentError::Missing {
                        param: p.name.clone(),
                        expected: required,
                        actual: supplied,
                    });
                }
            };
            out.push((p.index, p.name.clone(), value));
        }

        for o in &spec.options {
            let flag = self.options.get(&o.name).copied().unwrap_or(false);
            out.push((o.index, o.name.clone(), ArgValue::Bool(flag)));
        }

        for g in &spec.option_groups {
            let choice = self.chosen.remove(&g.spec.name).unwrap_or_else(|| g.default.clone());
            out.push((g.index, g.spec.name.clone(), ArgValue::Str(choice)));
        }

        for p in &spec.params {
            let value = match (self.named.remove(&p.spec.name), &p.default) {
                (Some(v), _) => v,
                (None, Some(d)) => d.clone(),
                (None, None) if p.spec.required => {
                    return Err(ArgumentError::Missing {
                        param: p.spec.name.clone(),
                        expected: 1,
                        actual: 0,
                    });
                }
                // 可选且无默认值：不出现在结果中
                (None, None) => continue,
            };
            out.push((p.index, p.spec.name.clone(), value));
        }

        out.sort_by_key(|(index, _, _)| *index);
        Ok(BoundArgs {
            values: out.into_iter().map(|(_, n, v)| (n, v)).collect(),
        })
    }
}

fn check_choices(param: &str, choices: &[String], value: &ArgValue) -> Result<(), ArgumentError> {
    let text = value.as_text();
    if choices.is_empty() || choices.contains(&text) {
        Ok(())
    } else {
        Err(ArgumentError::InvalidChoice {
            param: param.to_string(),
            value: text,
            choices: choices.to_vec(),
        })
    }
}

fn option_value(name: &str, value: Option<&Element>) -> Result<bool, ArgumentError> {
    let Some(el) = value else { return Ok(true) };
    convert(name, el, &Annotation::Bool).map(|v| matches!(v, ArgValue::Bool(true)))
}

/// 严格的布尔解析
pub fn parse_bool(text: &str) -> Option<bool> {
    match text.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// 按注解转换；多类型按声明顺序尝试，全部失败时列出每种类型的原因
pub fn convert(param: &str, el: &Element, annotation: &Annotation) -> Result<ArgValue, ArgumentError> {
    let candidates: Vec<&Annotation> = match annotation {
        Annotation::Union(items) => items.iter().collect(),
        single => vec![single],
    };

    let mut attempts = Vec::new();
    for ann in candidates {
        match convert_one(el, ann) {
            Ok(v) => return Ok(v),
            Err(reason) => attempts.push(ConversionAttempt {
                type_name: ann.to_string(),
                reason,
            }),
        }
    }
    Err(ArgumentError::Conversion {
        param: param.to_string(),
        value: el.summary(),
        attempts,
    })
}

fn convert_one(el: &Element, annotation: &Annotation) -> Result<ArgValue, String> {
    if let Annotation::Segment(kind) = annotation {
        return match el {
            Element::Segment(seg) if kind.as_deref().is_none_or(|k| k == seg.kind) => {
                Ok(ArgValue::Segment(seg.clone()))
            }
            Element::Segment(seg) => Err(format!("消息段类型为 {}", seg.kind)),
            _ => Err("需要消息段，得到文本".to_string()),
        };
    }

    let Some(text) = el.as_text() else {
        return Err("需要文本，得到消息段".to_string());
    };
    match annotation {
        Annotation::Str => Ok(ArgValue::Str(text.to_string())),
        Annotation::Int => text.parse::<i64>().map(ArgValue::Int).map_err(|e| e.to_string()),
        Annotation::Float => match text.parse::<f64>() {
            Ok(x) if x.is_finite() => Ok(ArgValue::Float(x)),
            Ok(_) => Err("不是有限数值".to_string()),
            Err(e) => Err(e.to_string()),
        },
        Annotation::Bool => parse_bool(text)
            .map(ArgValue::Bool)
            .ok_or_else(|| "可选值为 true/false/yes/no/on/off/1/0".to_string()),
        other => Err(format!("不支持的类型 {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Segment;
    use serde_json::Map;

    fn word(s: &str) -> Element {
        Element::Word(s.to_string())
    }

    #[test]
    fn union_tries_types_in_declaration_order() {
        let ann = Annotation::Union(vec![Annotation::Int, Annotation::Str]);
        assert_eq!(convert("x", &word("5"), &ann).unwrap(), ArgValue::Int(5));
        assert_eq!(convert("x", &word("five"), &ann).unwrap(), ArgValue::Str("five".into()));

        let ann = Annotation::Union(vec![Annotation::Str, Annotation::Int]);
        assert_eq!(convert("x", &word("5"), &ann).unwrap(), ArgValue::Str("5".into()));
    }

    #[test]
    fn failed_union_lists_every_attempt() {
        let ann = Annotation::Union(vec![Annotation::Int, Annotation::Float]);
        let err = convert("n", &word("abc"), &ann).unwrap_err();
        match err {
            ArgumentError::Conversion { param, value, attempts } => {
                assert_eq!(param, "n");
                assert_eq!(value, "abc");
                assert_eq!(attempts.len(), 2);
                assert_eq!(attempts[0].type_name, "int");
                assert_eq!(attempts[1].type_name, "float");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn bool_parsing_is_strict() {
        assert_eq!(parse_bool("YES"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
        assert!(convert("b", &word("2"), &Annotation::Bool).is_err());
    }

    #[test]
    fn segment_kinds_must_match() {
        let mut data = Map::new();
        data.insert("qq".into(), "1".into());
        let at = Element::Segment(Segment::new("at", data));

        assert!(convert("u", &at, &Annotation::segment("at")).is_ok());
        assert!(convert("u", &at, &Annotation::any_segment()).is_ok());
        assert!(convert("u", &at, &Annotation::segment("image")).is_err());
        assert!(convert("u", &at, &Annotation::Str).is_err());
        assert!(convert("u", &word("x"), &Annotation::segment("at")).is_err());
    }

    #[test]
    fn bound_args_typed_access() {
        let args = BoundArgs {
            values: vec![("a".into(), ArgValue::Int(5)), ("b".into(), ArgValue::Str("x".into()))],
        };
        assert_eq!(args.get::<i64>("a"), Some(5));
        assert_eq!(args.get::<String>("b").as_deref(), Some("x"));
        assert_eq!(args.get::<bool>("a"), None);
        assert_eq!(args.len(), 2);
    }
}
