use std::fmt;

/// First digit of a reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyClass {
    /// 1xx: the command was accepted, another reply follows.
    Preliminary,
    /// 2xx
    Success,
    /// 3xx: the server waits for more information (PASS after USER, RNTO after RNFR).
    Intermediate,
    /// 4xx: worth trying again later.
    TransientError,
    /// 5xx
    PermanentError,
}

/// Second digit of a reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyFunction {
    Syntax,
    Information,
    Connection,
    Authentication,
    Unspecified,
    FileSystem,
}

impl ReplyClass {
    pub fn from_code(code: u16) -> Option<ReplyClass> {
        match code / 100 {
            1 => Some(ReplyClass::Preliminary),
            2 => Some(ReplyClass::Success),
            3 => Some(ReplyClass::Intermediate),
            4 => Some(ReplyClass::TransientError),
            5 => Some(ReplyClass::PermanentError),
            _ => None,
        }
    }

    pub fn is_error(self) -> bool {
        matches!(self, ReplyClass::TransientError | ReplyClass::PermanentError)
    }
}

impl ReplyFunction {
    pub fn from_code(code: u16) -> ReplyFunction {
        match (code / 10) % 10 {
            0 => ReplyFunction::Syntax,
            1 => ReplyFunction::Information,
            2 => ReplyFunction::Connection,
            3 => ReplyFunction::Authentication,
            5 => ReplyFunction::FileSystem,
            _ => ReplyFunction::Unspecified,
        }
    }
}

/// One complete server reply, single or multi-line.
///
/// The class and function are computed from `code` once, so callers branch on
/// enums instead of comparing digits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtpReply {
    pub code: u16,
    class: ReplyClass,
    /// Raw reply lines without line terminators, code prefixes included.
    pub lines: Vec<String>,
}

impl FtpReply {
    /// Returns `None` when the first digit of `code` is not 1 to 5.
    pub fn new(code: u16, lines: Vec<String>) -> Option<FtpReply> {
        let class = ReplyClass::from_code(code)?;
        if code > 599 {
            return None;
        }
        Some(FtpReply { code, class, lines })
    }

    pub fn class(&self) -> ReplyClass {
        self.class
    }

    pub fn function(&self) -> ReplyFunction {
        ReplyFunction::from_code(self.code)
    }

    pub fn is_preliminary(&self) -> bool {
        self.class == ReplyClass::Preliminary
    }

    pub fn is_success(&self) -> bool {
        self.class == ReplyClass::Success
    }

    pub fn is_intermediate(&self) -> bool {
        self.class == ReplyClass::Intermediate
    }

    pub fn is_transient_error(&self) -> bool {
        self.class == ReplyClass::TransientError
    }

    pub fn is_permanent_error(&self) -> bool {
        self.class == ReplyClass::PermanentError
    }

    /// 500-504: the server did not understand the command or its arguments.
    pub fn is_syntax_error(&self) -> bool {
        self.class == ReplyClass::PermanentError && self.function() == ReplyFunction::Syntax
    }

    /// Full reply text, lines joined with `\n`.
    pub fn text(&self) -> String {
        self.lines.join("\n")
    }

    /// Text of the last line without the code prefix.
    pub fn message(&self) -> &str {
        self.lines
            .last()
            .map(|line| line.get(4..).unwrap_or("").trim_end())
            .unwrap_or("")
    }
}

impl fmt::Display for FtpReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_from_first_digit() {
        assert_eq!(ReplyClass::from_code(150), Some(ReplyClass::Preliminary));
        assert_eq!(ReplyClass::from_code(226), Some(ReplyClass::Success));
        assert_eq!(ReplyClass::from_code(331), Some(ReplyClass::Intermediate));
        assert_eq!(ReplyClass::from_code(421), Some(ReplyClass::TransientError));
        assert_eq!(ReplyClass::from_code(550), Some(ReplyClass::PermanentError));
        assert_eq!(ReplyClass::from_code(650), None);
        assert_eq!(ReplyClass::from_code(42), None);
    }

    #[test]
    fn test_function_from_second_digit() {
        assert_eq!(ReplyFunction::from_code(500), ReplyFunction::Syntax);
        assert_eq!(ReplyFunction::from_code(215), ReplyFunction::Information);
        assert_eq!(ReplyFunction::from_code(425), ReplyFunction::Connection);
        assert_eq!(ReplyFunction::from_code(530), ReplyFunction::Authentication);
        assert_eq!(ReplyFunction::from_code(550), ReplyFunction::FileSystem);
        assert_eq!(ReplyFunction::from_code(246), ReplyFunction::Unspecified);
    }

    #[test]
    fn test_message_strips_code() {
        let reply = FtpReply::new(550, vec!["550 No such file".to_string()]).unwrap();
        assert_eq!(reply.message(), "No such file");
        assert!(reply.is_permanent_error());
        assert!(!reply.is_syntax_error());
        assert_eq!(reply.to_string(), "550 No such file");
    }
}
