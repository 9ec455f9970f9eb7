//! 表驱动的逐字符解析状态机
//!
//! 每个状态对应一组有序的转移，每个转移由单字符谓词、可选动作和目标状态组成。
//! 主循环读取一个字符，在当前状态的转移表中查找第一个匹配的谓词，执行动作，
//! 推进输入游标（ε 转移不推进）并进入目标状态，直到到达终止状态。
//! 没有匹配的转移时，根据状态的期望描述生成解析错误。

use super::{FnCall, ParseMode};
use crate::error::{PolicyError, Result};
use crate::value::{Argument, Value};

/// 输入结束标记
const END: char = '\0';

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// 列表项（或变量定义）开始
    ItemStart,
    /// 已读取 `!`
    Inverted,
    Name,
    /// 刚读取 `(`
    OpenParen,
    /// 参数分隔符之后；单参数模式的初始状态
    ArgSep,
    StringBody,
    /// 已读取 `-`
    NumberSign,
    IntDigits,
    /// 已读取 `.`
    FracStart,
    FracDigits,
    BoolWord,
    /// 已读取 `$`
    VarStart,
    VarName,
    ArgDone,
    /// 已读取 `)`
    CallEnd,
    Trailing,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    PushName,
    SetInverted,
    BeginCall,
    BeginString,
    BeginNumber,
    MarkFloat,
    BeginBool,
    BeginVariable,
    PushArg,
    FinishArg,
    FinishCall,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    String,
    Int,
    Float,
    Bool,
    Variable,
}

struct Transition {
    accepts: fn(char) -> bool,
    action: Option<Action>,
    next: State,
    /// false 表示 ε 转移：执行动作但不消耗字符
    consume: bool,
}

const fn on(accepts: fn(char) -> bool, action: Option<Action>, next: State) -> Transition {
    Transition {
        accepts,
        action,
        next,
        consume: true,
    }
}

const fn epsilon(accepts: fn(char) -> bool, action: Action, next: State) -> Transition {
    Transition {
        accepts,
        action: Some(action),
        next,
        consume: false,
    }
}

/// 状态定义：按顺序扫描的转移组，以及无匹配时的期望描述
struct StateDef {
    groups: &'static [&'static [Transition]],
    expected: &'static str,
}

impl StateDef {
    fn find(&self, c: char) -> Option<&'static Transition> {
        self.groups
            .iter()
            .flat_map(|group| group.iter())
            .find(|t| (t.accepts)(c))
    }
}

// ---------------------------------------------------------------------------
// 字符谓词
// ---------------------------------------------------------------------------

fn is_end(c: char) -> bool {
    c == END
}

fn is_space(c: char) -> bool {
    c == ' ' || c == '\t'
}

fn is_separator(c: char) -> bool {
    is_space(c) || c == ','
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

fn is_digit(c: char) -> bool {
    c.is_ascii_digit()
}

fn is_minus(c: char) -> bool {
    c == '-'
}

fn is_dot(c: char) -> bool {
    c == '.'
}

fn is_quote(c: char) -> bool {
    c == '"'
}

fn is_dollar(c: char) -> bool {
    c == '$'
}

fn is_bang(c: char) -> bool {
    c == '!'
}

fn is_open(c: char) -> bool {
    c == '('
}

fn is_close(c: char) -> bool {
    c == ')'
}

fn is_bool_start(c: char) -> bool {
    matches!(c, 't' | 'T' | 'y' | 'Y' | 'f' | 'F' | 'n' | 'N')
}

fn is_alpha(c: char) -> bool {
    c.is_ascii_alphabetic()
}

fn is_not_end(c: char) -> bool {
    c != END
}

fn any(_: char) -> bool {
    true
}

// ---------------------------------------------------------------------------
// 转移表
// ---------------------------------------------------------------------------

const SKIP_SPACE_ITEM: &[Transition] = &[on(is_space, None, State::ItemStart)];
const BANG: &[Transition] = &[on(is_bang, Some(Action::SetInverted), State::Inverted)];
const NAME_START: &[Transition] = &[on(is_ident_start, Some(Action::PushName), State::Name)];
const LIST_END: &[Transition] = &[on(is_end, None, State::Done)];

const NAME: &[Transition] = &[
    on(is_ident, Some(Action::PushName), State::Name),
    on(is_open, Some(Action::BeginCall), State::OpenParen),
];

const ARG_START: &[Transition] = &[
    on(is_quote, Some(Action::BeginString), State::StringBody),
    on(is_minus, Some(Action::BeginNumber), State::NumberSign),
    on(is_digit, Some(Action::BeginNumber), State::IntDigits),
    on(is_bool_start, Some(Action::BeginBool), State::BoolWord),
    on(is_dollar, Some(Action::BeginVariable), State::VarStart),
];

const CLOSE_CALL: &[Transition] = &[on(is_close, Some(Action::FinishCall), State::CallEnd)];
const SKIP_SPACE_OPEN: &[Transition] = &[on(is_space, None, State::OpenParen)];
const SKIP_SEPARATOR: &[Transition] = &[on(is_separator, None, State::ArgSep)];
const SKIP_SPACE_ARG: &[Transition] = &[on(is_space, None, State::ArgSep)];

const STRING_CLOSE: &[Transition] = &[on(is_quote, Some(Action::FinishArg), State::ArgDone)];
const STRING_BODY: &[Transition] = &[on(is_not_end, Some(Action::PushArg), State::StringBody)];
const STRING_TO_END: &[Transition] = &[
    epsilon(is_end, Action::FinishArg, State::ArgDone),
    on(any, Some(Action::PushArg), State::StringBody),
];

const NUMBER_SIGN: &[Transition] = &[on(is_digit, Some(Action::PushArg), State::IntDigits)];
const INT_DIGITS: &[Transition] = &[
    on(is_digit, Some(Action::PushArg), State::IntDigits),
    on(is_dot, Some(Action::MarkFloat), State::FracStart),
    epsilon(any, Action::FinishArg, State::ArgDone),
];
const FRAC_START: &[Transition] = &[on(is_digit, Some(Action::PushArg), State::FracDigits)];
const FRAC_DIGITS: &[Transition] = &[
    on(is_digit, Some(Action::PushArg), State::FracDigits),
    epsilon(any, Action::FinishArg, State::ArgDone),
];
const BOOL_WORD: &[Transition] = &[
    on(is_alpha, Some(Action::PushArg), State::BoolWord),
    epsilon(any, Action::FinishArg, State::ArgDone),
];
const VAR_START: &[Transition] = &[on(is_ident_start, Some(Action::PushArg), State::VarName)];
const VAR_NAME: &[Transition] = &[
    on(is_ident, Some(Action::PushArg), State::VarName),
    epsilon(any, Action::FinishArg, State::ArgDone),
];

const TO_TRAILING: &[Transition] = &[on(is_space, None, State::Trailing)];

static ITEM_START_CONDITIONS: StateDef = StateDef {
    groups: &[SKIP_SPACE_ITEM, BANG, NAME_START, LIST_END],
    expected: "条件名、'!' 或输入结束",
};
static ITEM_START_VARIABLE: StateDef = StateDef {
    groups: &[SKIP_SPACE_ITEM, NAME_START],
    expected: "变量名",
};
static ITEM_START_ACTIONS: StateDef = StateDef {
    groups: &[SKIP_SPACE_ITEM, NAME_START, LIST_END],
    expected: "动作名或输入结束",
};
static INVERTED_DEF: StateDef = StateDef {
    groups: &[NAME_START],
    expected: "条件名",
};
static NAME_DEF: StateDef = StateDef {
    groups: &[NAME],
    expected: "标识符字符或 '('",
};
static OPEN_PAREN_DEF: StateDef = StateDef {
    groups: &[SKIP_SPACE_OPEN, CLOSE_CALL, ARG_START],
    expected: "参数或 ')'",
};
static ARG_SEP_SINGLE: StateDef = StateDef {
    groups: &[SKIP_SPACE_ARG, ARG_START],
    expected: "参数字面量",
};
static ARG_SEP_CALL: StateDef = StateDef {
    groups: &[SKIP_SEPARATOR, CLOSE_CALL, ARG_START],
    expected: "参数或 ')'",
};
static STRING_BODY_SINGLE: StateDef = StateDef {
    groups: &[STRING_CLOSE, STRING_TO_END],
    expected: "字符串内容",
};
static STRING_BODY_CALL: StateDef = StateDef {
    groups: &[STRING_CLOSE, STRING_BODY],
    expected: "'\"'",
};
static NUMBER_SIGN_DEF: StateDef = StateDef {
    groups: &[NUMBER_SIGN],
    expected: "数字",
};
static INT_DIGITS_DEF: StateDef = StateDef {
    groups: &[INT_DIGITS],
    expected: "数字",
};
static FRAC_START_DEF: StateDef = StateDef {
    groups: &[FRAC_START],
    expected: "小数部分数字",
};
static FRAC_DIGITS_DEF: StateDef = StateDef {
    groups: &[FRAC_DIGITS],
    expected: "数字",
};
static BOOL_WORD_DEF: StateDef = StateDef {
    groups: &[BOOL_WORD],
    expected: "布尔字面量",
};
static VAR_START_DEF: StateDef = StateDef {
    groups: &[VAR_START],
    expected: "变量名",
};
static VAR_NAME_DEF: StateDef = StateDef {
    groups: &[VAR_NAME],
    expected: "变量名",
};
static ARG_DONE_SINGLE: StateDef = StateDef {
    groups: &[TO_TRAILING, LIST_END],
    expected: "输入结束",
};
static ARG_DONE_CALL: StateDef = StateDef {
    groups: &[SKIP_SEPARATOR, CLOSE_CALL],
    expected: "参数分隔符或 ')'",
};
static CALL_END_LIST: StateDef = StateDef {
    groups: &[SKIP_SPACE_ITEM, LIST_END],
    expected: "空格或输入结束",
};
static TRAILING_DEF: StateDef = StateDef {
    groups: &[TO_TRAILING, LIST_END],
    expected: "输入结束",
};
static DONE_DEF: StateDef = StateDef {
    groups: &[],
    expected: "输入结束",
};

/// 按解析模式和状态查找状态定义
///
/// 只有列表边界处的状态随模式不同，参数内部的状态在各模式间共享。
fn state_def(mode: ParseMode, state: State) -> &'static StateDef {
    let is_list = matches!(
        mode,
        ParseMode::Conditions | ParseMode::Actions | ParseMode::UndoActions
    );

    match state {
        State::ItemStart => match mode {
            ParseMode::Conditions => &ITEM_START_CONDITIONS,
            ParseMode::VariableDefinition => &ITEM_START_VARIABLE,
            _ => &ITEM_START_ACTIONS,
        },
        State::Inverted => &INVERTED_DEF,
        State::Name => &NAME_DEF,
        State::OpenParen => &OPEN_PAREN_DEF,
        State::ArgSep if mode == ParseMode::Argument => &ARG_SEP_SINGLE,
        State::ArgSep => &ARG_SEP_CALL,
        State::StringBody if mode == ParseMode::Argument => &STRING_BODY_SINGLE,
        State::StringBody => &STRING_BODY_CALL,
        State::NumberSign => &NUMBER_SIGN_DEF,
        State::IntDigits => &INT_DIGITS_DEF,
        State::FracStart => &FRAC_START_DEF,
        State::FracDigits => &FRAC_DIGITS_DEF,
        State::BoolWord => &BOOL_WORD_DEF,
        State::VarStart => &VAR_START_DEF,
        State::VarName => &VAR_NAME_DEF,
        State::ArgDone if mode == ParseMode::Argument => &ARG_DONE_SINGLE,
        State::ArgDone => &ARG_DONE_CALL,
        State::CallEnd if is_list => &CALL_END_LIST,
        State::CallEnd | State::Trailing => &TRAILING_DEF,
        State::Done => &DONE_DEF,
    }
}

fn initial_state(mode: ParseMode) -> State {
    match mode {
        ParseMode::Argument => State::ArgSep,
        _ => State::ItemStart,
    }
}

/// 字符的可读描述，控制字符使用名称
pub(crate) fn describe_char(c: char) -> String {
    match c {
        END => "输入结束".to_string(),
        ' ' => "空格".to_string(),
        '\t' => "制表符".to_string(),
        '\n' => "换行符".to_string(),
        '\r' => "回车符".to_string(),
        c if c.is_control() => format!("控制字符 U+{:04X}", c as u32),
        c => format!("'{}'", c),
    }
}

/// 解析布尔字面量
fn parse_bool(word: &str) -> Option<bool> {
    match word.to_ascii_lowercase().as_str() {
        "t" | "true" | "y" | "yes" => Some(true),
        "f" | "false" | "n" | "no" => Some(false),
        _ => None,
    }
}

/// 状态机运行结果
#[derive(Debug, Default)]
pub(crate) struct Output {
    pub calls: Vec<FnCall>,
    /// 单参数模式下的参数
    pub args: Vec<Argument>,
}

/// 解析状态机
pub(crate) struct Machine {
    mode: ParseMode,
    state: State,
    name: String,
    inverted: bool,
    arg_kind: ArgKind,
    arg_buf: String,
    args: Vec<Argument>,
    calls: Vec<FnCall>,
}

impl Machine {
    pub fn new(mode: ParseMode) -> Self {
        Self {
            mode,
            state: initial_state(mode),
            name: String::new(),
            inverted: false,
            arg_kind: ArgKind::String,
            arg_buf: String::new(),
            args: Vec::new(),
            calls: Vec::new(),
        }
    }

    /// 对整个输入运行状态机，直到终止状态或第一个错误
    pub fn run(mut self, input: &str) -> Result<Output> {
        let chars: Vec<char> = input.chars().collect();

        if let Some(position) = chars.iter().position(|&c| c == END) {
            return Err(PolicyError::Parse {
                mode: self.mode,
                position,
                found: "控制字符 U+0000".to_string(),
                expected: "可打印字符",
            });
        }

        let mut pos = 0;
        while self.state != State::Done {
            let c = chars.get(pos).copied().unwrap_or(END);
            let def = state_def(self.mode, self.state);

            let transition = match def.find(c) {
                Some(t) => t,
                None => return Err(self.error(pos, c, def.expected)),
            };

            if let Some(action) = transition.action {
                self.apply(action, c)?;
            }
            if transition.consume {
                pos += 1;
            }
            self.state = transition.next;
        }

        Ok(Output {
            calls: self.calls,
            args: self.args,
        })
    }

    fn error(&self, position: usize, c: char, expected: &'static str) -> PolicyError {
        PolicyError::Parse {
            mode: self.mode,
            position,
            found: describe_char(c),
            expected,
        }
    }

    fn apply(&mut self, action: Action, c: char) -> Result<()> {
        match action {
            Action::PushName => self.name.push(c),
            Action::SetInverted => self.inverted = true,
            Action::BeginCall => self.args.clear(),
            Action::BeginString => self.begin_arg(ArgKind::String, None),
            Action::BeginNumber => self.begin_arg(ArgKind::Int, Some(c)),
            Action::MarkFloat => {
                self.arg_kind = ArgKind::Float;
                self.arg_buf.push(c);
            }
            Action::BeginBool => self.begin_arg(ArgKind::Bool, Some(c)),
            Action::BeginVariable => self.begin_arg(ArgKind::Variable, None),
            Action::PushArg => self.arg_buf.push(c),
            Action::FinishArg => self.finish_arg()?,
            Action::FinishCall => self.finish_call()?,
        }
        Ok(())
    }

    fn begin_arg(&mut self, kind: ArgKind, first: Option<char>) {
        self.arg_kind = kind;
        self.arg_buf.clear();
        if let Some(c) = first {
            self.arg_buf.push(c);
        }
    }

    fn finish_arg(&mut self) -> Result<()> {
        if self.mode == ParseMode::VariableDefinition && !self.args.is_empty() {
            return Err(PolicyError::MultipleValues(self.name.clone()));
        }

        let raw = std::mem::take(&mut self.arg_buf);
        let arg = match self.arg_kind {
            ArgKind::String => Argument::Literal(Value::String(raw)),
            ArgKind::Int => raw
                .parse::<i64>()
                .map(|i| Argument::Literal(Value::Int(i)))
                .map_err(|_| PolicyError::InvalidNumber(raw))?,
            ArgKind::Float => raw
                .parse::<f64>()
                .map(|f| Argument::Literal(Value::Float(f)))
                .map_err(|_| PolicyError::InvalidNumber(raw))?,
            ArgKind::Bool => match parse_bool(&raw) {
                Some(b) => Argument::Literal(Value::Bool(b)),
                None => return Err(PolicyError::BadBoolean(raw)),
            },
            ArgKind::Variable => Argument::Variable(raw),
        };

        self.args.push(arg);
        Ok(())
    }

    fn finish_call(&mut self) -> Result<()> {
        let name = std::mem::take(&mut self.name);
        if self.mode == ParseMode::VariableDefinition && self.args.is_empty() {
            return Err(PolicyError::MissingValue(name));
        }

        self.calls.push(FnCall {
            name,
            inverted: std::mem::take(&mut self.inverted),
            args: std::mem::take(&mut self.args),
        });
        Ok(())
    }
}
