//! 命令描述数据结构
//!
//! `Signature` 是处理函数参数表的显式描述，`Decorator` 是附加在命令上的选项、
//! 选项组与命名参数声明。二者在注册时由分析器合并为 `CommandSpec`。

use crate::executor::HandlerFn;
use crate::filter::Filter;
use crate::message::Segment;
use std::fmt;

// ============================================================================
// 1. 类型注解
// ============================================================================

/// 可作为处理函数第一个参数的事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAnnotation {
    Message,
    GroupMessage,
    PrivateMessage,
    Notice,
    Request,
}

impl EventAnnotation {
    /// 是否为消息事件（或其子类型）
    pub fn is_message(self) -> bool {
        matches!(self, Self::Message | Self::GroupMessage | Self::PrivateMessage)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Annotation {
    Event(EventAnnotation),
    Str,
    Int,
    Float,
    Bool,
    /// 消息段，None 表示任意类型的消息段
    Segment(Option<String>),
    /// 多类型参数，按声明顺序尝试
    Union(Vec<Annotation>),
    /// 不支持的类型，保留名称用于报错
    Unsupported(String),
}

impl Annotation {
    pub fn segment(kind: &str) -> Self {
        Self::Segment(Some(kind.to_string()))
    }

    pub fn any_segment() -> Self {
        Self::Segment(None)
    }

    /// 绑定器能否处理此类型
    pub fn is_bindable(&self) -> bool {
        match self {
            Self::Str | Self::Int | Self::Float | Self::Bool | Self::Segment(_) => true,
            Self::Union(items) => {
                !items.is_empty()
                    && items
                        .iter()
                        .all(|a| !matches!(a, Self::Union(_)) && a.is_bindable())
            }
            Self::Event(_) | Self::Unsupported(_) => false,
        }
    }
}

impl fmt::Display for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Event(e) => write!(f, "{e:?}Event"),
            Self::Str => f.write_str("str"),
            Self::Int => f.write_str("int"),
            Self::Float => f.write_str("float"),
            Self::Bool => f.write_str("bool"),
            Self::Segment(Some(kind)) => write!(f, "segment<{kind}>"),
            Self::Segment(None) => f.write_str("segment"),
            Self::Union(items) => {
                let names: Vec<String> = items.iter().map(ToString::to_string).collect();
                f.write_str(&names.join(" | "))
            }
            Self::Unsupported(name) => f.write_str(name),
        }
    }
}

// ============================================================================
// 2. 参数值
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Segment(Segment),
}

impl ArgValue {
    /// 文本形式，用于 choices 比较和帮助信息
    pub fn as_text(&self) -> String {
        match self {
            Self::Str(s) => s.clone(),
            Self::Int(n) => n.to_string(),
            Self::Float(x) => x.to_string(),
            Self::Bool(b) => b.to_string(),
            Self::Segment(seg) => seg.summary(),
        }
    }
}

impl From<&str> for ArgValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for ArgValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for ArgValue {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<i32> for ArgValue {
    fn from(n: i32) -> Self {
        Self::Int(n as i64)
    }
}

impl From<f64> for ArgValue {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for ArgValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<Segment> for ArgValue {
    fn from(seg: Segment) -> Self {
        Self::Segment(seg)
    }
}

/// 从绑定值中取出具体类型
pub trait FromArg: Sized {
    fn from_arg(value: &ArgValue) -> Option<Self>;
}

impl FromArg for String {
    fn from_arg(value: &ArgValue) -> Option<Self> {
        match value {
            ArgValue::Str(s) => Some(s.clone()),
            _ => None,
        }
    }
}

impl FromArg for i64 {
    fn from_arg(value: &ArgValue) -> Option<Self> {
        match value {
            ArgValue::Int(n) => Some(*n),
            _ => None,
        }
    }
}

impl FromArg for f64 {
    fn from_arg(value: &ArgValue) -> Option<Self> {
        match value {
            ArgValue::Float(x) => Some(*x),
            ArgValue::Int(n) => Some(*n as f64),
            _ => None,
        }
    }
}

impl FromArg for bool {
    fn from_arg(value: &ArgValue) -> Option<Self> {
        match value {
            ArgValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl FromArg for Segment {
    fn from_arg(value: &ArgValue) -> Option<Self> {
        match value {
            ArgValue::Segment(seg) => Some(seg.clone()),
            _ => None,
        }
    }
}

impl FromArg for ArgValue {
    fn from_arg(value: &ArgValue) -> Option<Self> {
        Some(value.clone())
    }
}

// ============================================================================
// 3. 函数签名描述
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub struct SigParam {
    pub name: String,
    pub annotation: Option<Annotation>,
    pub default: Option<ArgValue>,
}

/// 处理函数的参数表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Signature {
    /// 是否有 self 接收者（插件方法）
    pub receiver: bool,
    pub params: Vec<SigParam>,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以消息事件作为第一个参数的常见签名
    pub fn message() -> Self {
        Self::new().event(EventAnnotation::Message)
    }

    pub fn receiver(mut self) -> Self {
        self.receiver = true;
        self
    }

    pub fn event(self, kind: EventAnnotation) -> Self {
        self.raw("event", Some(Annotation::Event(kind)), None)
    }

    pub fn param(self, name: &str, annotation: Annotation) -> Self {
        self.raw(name, Some(annotation), None)
    }

    pub fn param_default(
        self,
        name: &str,
        annotation: Annotation,
        default: impl Into<ArgValue>,
    ) -> Self {
        self.raw(name, Some(annotation), Some(default.into()))
    }

    /// 任意形式的参数，包括缺少注解的参数
    pub fn raw(
        mut self,
        name: &str,
        annotation: Option<Annotation>,
        default: Option<ArgValue>,
    ) -> Self {
        self.params.push(SigParam {
            name: name.to_string(),
            annotation,
            default,
        });
        self
    }
}

// ============================================================================
// 4. 装饰器声明
// ============================================================================

/// 布尔选项 `-v` / `--verbose`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionSpec {
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub description: String,
}

impl OptionSpec {
    pub fn short(name: &str) -> Self {
        Self {
            short_name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn long(name: &str) -> Self {
        Self {
            long_name: Some(name.to_string()),
            ..Self::default()
        }
    }

    pub fn with_long(mut self, name: &str) -> Self {
        self.long_name = Some(name.to_string());
        self
    }

    pub fn with_short(mut self, name: &str) -> Self {
        self.short_name = Some(name.to_string());
        self
    }

    pub fn describe(mut self, text: &str) -> Self {
        self.description = text.to_string();
        self
    }

    /// 绑定到的函数参数名：优先长选项名，`-` 转为 `_`
    pub fn bind_name(&self) -> Option<String> {
        self.long_name
            .as_deref()
            .map(|l| l.replace('-', "_"))
            .or_else(|| self.short_name.clone())
    }

    pub fn matches_long(&self, name: &str) -> bool {
        self.long_name.as_deref() == Some(name)
    }

    pub fn matches_short(&self, c: char) -> bool {
        self.short_name
            .as_deref()
            .is_some_and(|s| s.chars().eq(std::iter::once(c)))
    }

    /// 形如 `-v, --verbose` 的展示文本
    pub fn display(&self) -> String {
        match (&self.short_name, &self.long_name) {
            (Some(s), Some(l)) => format!("-{s}, --{l}"),
            (Some(s), None) => format!("-{s}"),
            (None, Some(l)) => format!("--{l}"),
            (None, None) => "<unnamed>".to_string(),
        }
    }
}

/// 互斥选项组，如 `--json` / `--xml` 绑定到 `format`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionGroupSpec {
    pub name: String,
    pub choices: Vec<String>,
    pub default: Option<String>,
    pub description: String,
}

impl OptionGroupSpec {
    pub fn new(name: &str, choices: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            choices: choices.iter().map(|c| c.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn default_choice(mut self, choice: &str) -> Self {
        self.default = Some(choice.to_string());
        self
    }

    pub fn describe(mut self, text: &str) -> Self {
        self.description = text.to_string();
        self
    }

    pub fn has_choice(&self, choice: &str) -> bool {
        self.choices.iter().any(|c| c == choice)
    }
}

/// 命名参数 `--name=value`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSpec {
    pub name: String,
    pub default: Option<ArgValue>,
    pub required: bool,
    pub choices: Vec<String>,
    pub description: String,
}

impl ParamSpec {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn default_value(mut self, value: impl Into<ArgValue>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn choices(mut self, choices: &[&str]) -> Self {
        self.choices = choices.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn describe(mut self, text: &str) -> Self {
        self.description = text.to_string();
        self
    }
}

/// 按声明顺序记录的装饰器
#[derive(Debug, Clone, PartialEq)]
pub enum Decorator {
    Option(OptionSpec),
    Group(OptionGroupSpec),
    Param(ParamSpec),
}

impl Decorator {
    pub fn bind_name(&self) -> Option<String> {
        match self {
            Self::Option(o) => o.bind_name(),
            Self::Group(g) => Some(g.name.clone()),
            Self::Param(p) => Some(p.name.clone()),
        }
    }
}

/// 过滤器声明：直接给出，或按名称从过滤器注册表中查找
#[derive(Clone)]
pub enum FilterDecl {
    Inline(Filter),
    Named(String),
}

// ============================================================================
// 5. 编译后的命令
// ============================================================================

/// 未被装饰的位置参数
#[derive(Debug, Clone, PartialEq)]
pub struct PositionalSpec {
    pub name: String,
    pub annotation: Annotation,
    pub default: Option<ArgValue>,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundOption {
    pub spec: OptionSpec,
    pub name: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundGroup {
    pub spec: OptionGroupSpec,
    pub default: String,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoundParam {
    pub spec: ParamSpec,
    pub annotation: Annotation,
    pub default: Option<ArgValue>,
    pub index: usize,
}

/// 命名参数的绑定目标
pub(crate) enum NamedTarget<'a> {
    Positional(&'a PositionalSpec),
    Param(&'a BoundParam),
}

/// 注册时校验通过的命令
pub struct CommandSpec {
    pub name: String,
    /// 所在命令组路径（不含命令名）
    pub group_path: Vec<String>,
    pub aliases: Vec<String>,
    pub description: String,
    /// None 表示使用全局前缀
    pub prefixes: Option<Vec<String>>,
    pub event: EventAnnotation,
    pub positionals: Vec<PositionalSpec>,
    pub options: Vec<BoundOption>,
    pub option_groups: Vec<BoundGroup>,
    pub params: Vec<BoundParam>,
    pub filters: Vec<Filter>,
    pub handler: HandlerFn,
    pub owner: Option<String>,
}

impl CommandSpec {
    /// 完整路径，如 `["admin", "kick"]`
    pub fn path(&self) -> Vec<String> {
        let mut path = self.group_path.clone();
        path.push(self.name.clone());
        path
    }

    pub fn full_name(&self) -> String {
        self.path().join(" ")
    }

    pub fn find_option_long(&self, name: &str) -> Option<&BoundOption> {
        self.options.iter().find(|o| o.spec.matches_long(name))
    }

    pub fn find_option_short(&self, c: char) -> Option<&BoundOption> {
        self.options.iter().find(|o| o.spec.matches_short(c))
    }

    pub fn find_group_by_choice(&self, choice: &str) -> Option<&BoundGroup> {
        self.option_groups.iter().find(|g| g.spec.has_choice(choice))
    }

    pub fn find_param(&self, name: &str) -> Option<&BoundParam> {
        self.params.iter().find(|p| p.spec.name == name)
    }

    pub(crate) fn find_named_target(&self, name: &str) -> Option<NamedTarget<'_>> {
        let normalized = name.replace('-', "_");
        if let Some(p) = self
            .params
            .iter()
            .find(|p| p.spec.name == name || p.spec.name == normalized)
        {
            return Some(NamedTarget::Param(p));
        }
        self.positionals
            .iter()
            .find(|p| p.name == name || p.name == normalized)
            .map(NamedTarget::Positional)
    }
}

impl fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandSpec")
            .field("path", &self.path())
            .field("aliases", &self.aliases)
            .field("positionals", &self.positionals)
            .field("options", &self.options)
            .field("option_groups", &self.option_groups)
            .field("params", &self.params)
            .field("owner", &self.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn option_bind_name_prefers_long() {
        let o = OptionSpec::short("d").with_long("dry-run");
        assert_eq!(o.bind_name().as_deref(), Some("dry_run"));
        assert_eq!(OptionSpec::short("v").bind_name().as_deref(), Some("v"));
        assert!(o.matches_short('d'));
        assert!(!OptionSpec::short("dd").matches_short('d'));
        assert_eq!(o.display(), "-d, --dry-run");
    }

    #[test]
    fn union_of_scalars_is_bindable() {
        assert!(Annotation::Union(vec![Annotation::Int, Annotation::Str]).is_bindable());
        assert!(!Annotation::Union(vec![]).is_bindable());
        assert!(!Annotation::Union(vec![Annotation::Int, Annotation::Unsupported("list".into())]).is_bindable());
        assert_eq!(
            Annotation::Union(vec![Annotation::Int, Annotation::segment("at")]).to_string(),
            "int | segment<at>"
        );
    }

    #[test]
    fn float_accepts_int_values() {
        assert_eq!(f64::from_arg(&ArgValue::Int(3)), Some(3.0));
        assert_eq!(i64::from_arg(&ArgValue::Float(3.0)), None);
    }
}
