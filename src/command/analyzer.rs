//! 注册期分析
//!
//! 把签名、装饰器与过滤器声明合并成 `CommandSpec`。所有问题一次性收集，
//! 以一个 `RegistrationError` 返回。

use super::error::RegistrationError;
use super::spec::{
    Annotation, ArgValue, BoundGroup, BoundOption, BoundParam, CommandSpec, Decorator, EventAnnotation,
    FilterDecl, PositionalSpec, SigParam, Signature,
};
use crate::executor::HandlerFn;
use crate::filter::{Filter, FilterRegistry};
use std::collections::{HashMap, HashSet};

/// 构建中的命令，由 `CommandBuilder` 填写
#[derive(Default)]
pub struct CommandDraft {
    pub name: String,
    pub group_path: Vec<String>,
    pub aliases: Vec<String>,
    pub description: String,
    pub prefixes: Option<Vec<String>>,
    pub signature: Option<Signature>,
    pub decorators: Vec<Decorator>,
    pub filters: Vec<FilterDecl>,
    pub handler: Option<HandlerFn>,
    pub owner: Option<String>,
}

impl CommandDraft {
    pub fn full_name(&self) -> String {
        let mut path = self.group_path.clone();
        path.push(self.name.clone());
        path.join(" ")
    }
}

/// 命令名与别名：非空，不含空白与 `.`，不以 `-` 开头
pub fn is_valid_command_name(name: &str) -> bool {
    !name.is_empty() && !name.starts_with('-') && !name.chars().any(|c| c.is_whitespace() || c == '.')
}

/// 短选项名：一个 ASCII 字母或数字
pub fn is_valid_short(name: &str) -> bool {
    let mut chars = name.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_ascii_alphanumeric())
}

/// 长选项名：至少两个 `[A-Za-z0-9_-]` 字符，不以 `-` 开头
pub fn is_valid_long(name: &str) -> bool {
    name.chars().count() >= 2
        && !name.starts_with('-')
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

struct Problems(Vec<String>);

impl Problems {
    fn push(&mut self, problem: impl Into<String>) {
        self.0.push(problem.into());
    }
}

pub struct Analyzer<'a> {
    filters: &'a FilterRegistry,
}

impl<'a> Analyzer<'a> {
    pub fn new(filters: &'a FilterRegistry) -> Self {
        Self { filters }
    }

    pub fn analyze(&self, draft: CommandDraft) -> Result<CommandSpec, RegistrationError> {
        let mut problems = Problems(Vec::new());
        let full_name = draft.full_name();

        self.check_names(&draft, &mut problems);

        if draft.handler.is_none() {
            problems.push("缺少处理函数");
        }
        let signature = draft.signature.clone().unwrap_or_default();
        if draft.signature.is_none() {
            problems.push("缺少函数签名");
        }

        let event = check_event_param(&signature, draft.signature.is_some(), &mut problems);
        let rest: &[SigParam] = signature.params.get(1..).unwrap_or(&[]);

        let mut seen = HashSet::new();
        for p in rest {
            if !seen.insert(p.name.as_str()) {
                problems.push(format!("函数签名中参数 '{}' 重复", p.name));
            }
        }

        check_options(&draft.decorators, &mut problems);
        check_params(&draft.decorators, rest, &mut problems);
        check_groups(&draft.decorators, rest, &mut problems);
        check_bind_names(&draft.decorators, rest, &mut problems);

        let decorated: HashSet<String> = draft.decorators.iter().filter_map(Decorator::bind_name).collect();
        check_suffix(rest, &decorated, &mut problems);
        let positionals = build_positionals(rest, &decorated, &mut problems);
        let (options, option_groups, params) = build_decorated(&draft.decorators, rest, &mut problems);

        let filters = self.resolve_filters(&draft.filters, &mut problems);

        if let Some(prefixes) = &draft.prefixes
            && prefixes.is_empty()
        {
            problems.push("命令前缀列表不能为空，允许无前缀请使用空字符串");
        }

        let handler = match (draft.handler, problems.0.is_empty()) {
            (Some(handler), true) => handler,
            _ => return Err(RegistrationError::new(full_name, problems.0)),
        };

        Ok(CommandSpec {
            name: draft.name,
            group_path: draft.group_path,
            aliases: draft.aliases,
            description: draft.description,
            prefixes: draft.prefixes,
            event,
            positionals,
            options,
            option_groups,
            params,
            filters,
            handler,
            owner: draft.owner,
        })
    }

    fn check_names(&self, draft: &CommandDraft, problems: &mut Problems) {
        if !is_valid_command_name(&draft.name) {
            problems.push(format!("命令名 '{}' 无效", draft.name));
        }
        let mut seen = HashSet::new();
        for alias in &draft.aliases {
            if !is_valid_command_name(alias) {
                problems.push(format!("别名 '{alias}' 无效"));
            } else if *alias == draft.name {
                problems.push(format!("别名 '{alias}' 与命令名相同"));
            } else if !seen.insert(alias.as_str()) {
                problems.push(format!("别名 '{alias}' 重复"));
            }
        }
    }

    fn resolve_filters(&self, decls: &[FilterDecl], problems: &mut Problems) -> Vec<Filter> {
        let mut out = Vec::new();
        for decl in decls {
            match decl {
                FilterDecl::Inline(f) => out.push(f.clone()),
                FilterDecl::Named(name) => match self.filters.get(name) {
                    Some(f) => out.push(f),
                    None => problems.push(format!("未知的过滤器 '{name}'")),
                },
            }
        }
        out
    }
}

fn check_event_param(signature: &Signature, present: bool, problems: &mut Problems) -> EventAnnotation {
    if !present {
        return EventAnnotation::Message;
    }
    match signature.params.first() {
        Some(SigParam {
            annotation: Some(Annotation::Event(kind)),
            ..
        }) if kind.is_message() => *kind,
        Some(SigParam {
            annotation: Some(Annotation::Event(kind)),
            name,
            ..
        }) => {
            problems.push(format!("第一个参数 '{name}' 的事件类型 {kind:?} 不是消息事件"));
            EventAnnotation::Message
        }
        Some(p) => {
            let ann = p
                .annotation
                .as_ref()
                .map_or_else(|| "无注解".to_string(), ToString::to_string);
            problems.push(format!("第一个参数 '{}' 必须标注为消息事件类型（当前: {ann}）", p.name));
            EventAnnotation::Message
        }
        None => {
            problems.push("处理函数至少需要一个事件参数");
            EventAnnotation::Message
        }
    }
}

/// 装饰器在同类中的序号与展示文本
fn describe_option(ordinal: usize, display: &str) -> String {
    format!("选项 #{ordinal} ({display})")
}

fn check_options(decorators: &[Decorator], problems: &mut Problems) {
    let mut shorts: HashMap<String, String> = HashMap::new();
    let mut longs: HashMap<String, String> = HashMap::new();

    let options = decorators.iter().filter_map(|d| match d {
        Decorator::Option(o) => Some(o),
        _ => None,
    });
    for (i, o) in options.enumerate() {
        let me = describe_option(i + 1, &o.display());
        if o.short_name.is_none() && o.long_name.is_none() {
            problems.push(format!("{me} 既没有短选项名也没有长选项名"));
        }
        if let Some(s) = &o.short_name {
            if !is_valid_short(s) {
                problems.push(format!("{me} 的短选项名 '{s}' 无效，必须是单个字母或数字"));
            } else if let Some(prev) = shorts.get(s) {
                problems.push(format!("{me} 与{prev} 的短选项名 '{s}' 冲突"));
            } else {
                shorts.insert(s.clone(), me.clone());
            }
        }
        if let Some(l) = &o.long_name {
            if !is_valid_long(l) {
                problems.push(format!("{me} 的长选项名 '{l}' 无效"));
            } else if let Some(prev) = longs.get(l) {
                problems.push(format!("{me} 与{prev} 的长选项名 '{l}' 冲突"));
            } else {
                longs.insert(l.clone(), me.clone());
            }
        }
    }
}

fn option_names(decorators: &[Decorator]) -> HashSet<String> {
    let mut names = HashSet::new();
    for d in decorators {
        if let Decorator::Option(o) = d {
            names.extend(o.short_name.iter().cloned());
            names.extend(o.long_name.iter().cloned());
        }
    }
    names
}

fn check_params(decorators: &[Decorator], rest: &[SigParam], problems: &mut Problems) {
    let opt_names = option_names(decorators);
    for d in decorators {
        let Decorator::Param(p) = d else { continue };
        if !is_valid_long(&p.name) && !is_valid_short(&p.name) {
            problems.push(format!("命名参数名 '{}' 无效", p.name));
        }
        if opt_names.contains(&p.name) {
            problems.push(format!("命名参数 '{}' 与选项名冲突", p.name));
        }

        let sig_default = rest.iter().find(|s| s.name == p.name).and_then(|s| s.default.clone());
        let default = p.default.clone().or(sig_default);
        if p.required && default.is_some() {
            problems.push(format!("命名参数 '{}' 声明为必填，但同时提供了默认值", p.name));
        }
        if let Some(d) = &default
            && !p.choices.is_empty()
            && !p.choices.contains(&d.as_text())
        {
            problems.push(format!(
                "命名参数 '{}' 的默认值 '{}' 不在可选范围 [{}] 内",
                p.name,
                d.as_text(),
                p.choices.join(", ")
            ));
        }
    }
}

fn check_groups(decorators: &[Decorator], rest: &[SigParam], problems: &mut Problems) {
    let opt_names = option_names(decorators);
    let bound: HashSet<String> = decorators.iter().filter_map(Decorator::bind_name).collect();
    let param_names: HashSet<&str> = decorators
        .iter()
        .filter_map(|d| match d {
            Decorator::Param(p) => Some(p.name.as_str()),
            _ => None,
        })
        .collect();
    // 未装饰的位置参数同样可以按名称赋值
    let positional_names: HashSet<&str> = rest
        .iter()
        .filter(|p| !bound.contains(&p.name))
        .map(|p| p.name.as_str())
        .collect();
    // 取值 -> 所属组
    let mut owners: HashMap<&str, &str> = HashMap::new();

    for d in decorators {
        let Decorator::Group(g) = d else { continue };
        if g.name.is_empty() {
            problems.push("选项组名称不能为空");
        }
        if g.choices.is_empty() {
            problems.push(format!("选项组 '{}' 没有任何可选值", g.name));
        }
        let mut local = HashSet::new();
        for c in &g.choices {
            if !local.insert(c.as_str()) {
                problems.push(format!("选项组 '{}' 的取值 '{c}' 重复", g.name));
                continue;
            }
            if !is_valid_long(c) && !is_valid_short(c) {
                problems.push(format!("选项组 '{}' 的取值 '{c}' 不能用作选项名", g.name));
            }
            if let Some(other) = owners.get(c.as_str()) {
                problems.push(format!("选项组 '{}' 的取值 '{c}' 与选项组 '{other}' 冲突", g.name));
            } else {
                owners.insert(c.as_str(), g.name.as_str());
            }
            if opt_names.contains(c) {
                problems.push(format!("选项组 '{}' 的取值 '{c}' 与选项名冲突", g.name));
            }
            if param_names.contains(c.as_str()) {
                problems.push(format!("选项组 '{}' 的取值 '{c}' 与命名参数冲突", g.name));
            }
            if positional_names.contains(c.as_str()) {
                problems.push(format!("选项组 '{}' 的取值 '{c}' 与位置参数冲突", g.name));
            }
        }
        if let Some(def) = &g.default
            && !g.has_choice(def)
        {
            problems.push(format!("选项组 '{}' 的默认值 '{def}' 不在可选值中", g.name));
        }
    }
}

fn check_bind_names(decorators: &[Decorator], rest: &[SigParam], problems: &mut Problems) {
    let mut bound: HashMap<String, usize> = HashMap::new();
    for (i, d) in decorators.iter().enumerate() {
        let Some(name) = d.bind_name() else { continue };
        if let Some(prev) = bound.get(&name) {
            problems.push(format!("装饰器 #{} 与装饰器 #{prev} 绑定到同一个参数 '{name}'", i + 1));
            continue;
        }
        bound.insert(name.clone(), i + 1);

        let Some(param) = rest.iter().find(|p| p.name == name) else {
            problems.push(format!("装饰器 #{} 绑定的参数 '{name}' 不在函数签名中", i + 1));
            continue;
        };
        let ann = param.annotation.as_ref();
        match d {
            Decorator::Option(_) if !matches!(ann, None | Some(Annotation::Bool)) => {
                problems.push(format!("选项参数 '{name}' 必须是 bool 类型"));
            }
            Decorator::Group(_) if !matches!(ann, None | Some(Annotation::Str)) => {
                problems.push(format!("选项组参数 '{name}' 必须是 str 类型"));
            }
            Decorator::Param(_) if ann.is_some_and(|a| !a.is_bindable()) => {
                problems.push(format!("命名参数 '{name}' 的类型 {} 不受支持", ann.map_or_else(String::new, ToString::to_string)));
            }
            _ => {}
        }
    }
}

/// 被装饰的参数必须连续位于参数表末尾
fn check_suffix(rest: &[SigParam], decorated: &HashSet<String>, problems: &mut Problems) {
    let Some(first) = rest.iter().position(|p| decorated.contains(&p.name)) else {
        return;
    };
    for p in &rest[first..] {
        if !decorated.contains(&p.name) {
            problems.push(format!(
                "未装饰的参数 '{}' 出现在被装饰的参数 '{}' 之后，被装饰的参数必须位于末尾",
                p.name, rest[first].name
            ));
        }
    }
}

fn build_positionals(rest: &[SigParam], decorated: &HashSet<String>, problems: &mut Problems) -> Vec<PositionalSpec> {
    let mut out = Vec::new();
    let mut seen_default: Option<&str> = None;

    for (index, p) in rest.iter().enumerate() {
        if decorated.contains(&p.name) {
            continue;
        }
        let annotation = match &p.annotation {
            None => {
                problems.push(format!("参数 '{}' 缺少类型注解", p.name));
                continue;
            }
            Some(a) if !a.is_bindable() => {
                problems.push(format!("参数 '{}' 的类型 {a} 不受支持", p.name));
                continue;
            }
            Some(a) => a.clone(),
        };
        match (&p.default, seen_default) {
            (Some(_), None) => seen_default = Some(&p.name),
            (None, Some(prev)) => {
                problems.push(format!("无默认值的参数 '{}' 不能位于有默认值的参数 '{prev}' 之后", p.name));
            }
            _ => {}
        }
        out.push(PositionalSpec {
            name: p.name.clone(),
            annotation,
            default: p.default.clone(),
            index,
        });
    }
    out
}

fn build_decorated(
    decorators: &[Decorator],
    rest: &[SigParam],
    problems: &mut Problems,
) -> (Vec<BoundOption>, Vec<BoundGroup>, Vec<BoundParam>) {
    let mut options = Vec::new();
    let mut groups = Vec::new();
    let mut params = Vec::new();

    for d in decorators {
        let Some(name) = d.bind_name() else { continue };
        let Some((index, sig)) = rest.iter().enumerate().find(|(_, p)| p.name == name) else {
            continue;
        };
        match d {
            Decorator::Option(o) => options.push(BoundOption {
                spec: o.clone(),
                name,
                index,
            }),
            Decorator::Group(g) => {
                let Some(default) = g.default.clone().or_else(|| g.choices.first().cloned()) else {
                    continue;
                };
                groups.push(BoundGroup {
                    spec: g.clone(),
                    default,
                    index,
                });
            }
            Decorator::Param(p) => {
                let annotation = sig.annotation.clone().unwrap_or(Annotation::Str);
                let default: Option<ArgValue> = p.default.clone().or_else(|| sig.default.clone());
                if let Some(d) = &default
                    && !default_fits(d, &annotation)
                {
                    problems.push(format!("命名参数 '{name}' 的默认值与类型 {annotation} 不符"));
                }
                params.push(BoundParam {
                    spec: p.clone(),
                    annotation,
                    default,
                    index,
                });
            }
        }
    }
    (options, groups, params)
}

fn default_fits(value: &ArgValue, annotation: &Annotation) -> bool {
    match (value, annotation) {
        (_, Annotation::Union(items)) => items.iter().any(|a| default_fits(value, a)),
        (ArgValue::Str(_), Annotation::Str)
        | (ArgValue::Int(_), Annotation::Int)
        | (ArgValue::Int(_) | ArgValue::Float(_), Annotation::Float)
        | (ArgValue::Bool(_), Annotation::Bool)
        | (ArgValue::Segment(_), Annotation::Segment(_)) => true,
        _ => false,
    }
}
