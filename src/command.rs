//! 命令系统
//!
//! 处理流程：`lexer` 切分消息 → `resolver` 找到命令 → `binder` 绑定参数。
//! 命令在注册时经 `analyzer` 校验，问题会一次性全部报告。

pub mod analyzer;
pub mod binder;
pub mod error;
pub mod group;
pub mod help;
pub mod lexer;
pub mod resolver;
pub mod spec;

pub use analyzer::{Analyzer, CommandDraft};
pub use binder::{Binder, BoundArgs};
pub use error::{ArgumentError, CommandNotFound, ConversionAttempt, ErrorFormatter, LexError, RegistrationError};
pub use group::{CommandBuilder, CommandGroup};
pub use help::HelpGenerator;
pub use lexer::{Arg, Element, Token, parse, parse_message, tokenize, tokenize_message};
pub use resolver::{CommandResolver, Resolution, check_prefixes};
pub use spec::{
    Annotation, ArgValue, CommandSpec, Decorator, EventAnnotation, FilterDecl, FromArg, OptionGroupSpec, OptionSpec,
    ParamSpec, Signature,
};
