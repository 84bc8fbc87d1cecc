use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferType {
    Ascii,
    Binary,
}

impl TransferType {
    fn code(self) -> &'static str {
        match self {
            TransferType::Ascii => "A",
            TransferType::Binary => "I",
        }
    }
}

/// A command sent on the control connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FtpCommand {
    USER(String),
    PASS(String),
    ACCT(String),
    /// `AUTH TLS`
    AUTH,
    /// `PBSZ 0`
    PBSZ,
    /// `PROT P` or `PROT C`
    PROT(bool),
    SYST,
    PWD,
    CWD(String),
    CDUP,
    TYPE(TransferType),
    /// `MODE Z` or `MODE S`
    MODE(bool),
    PASV,
    PORT(String),
    /// The configured listing command (`LIST`, `NLST`, `LIST -la`...), optional path.
    LIST(String, Option<String>),
    RETR(String),
    STOR(String),
    APPE(String),
    REST(u64),
    SIZE(String),
    DELE(String),
    RMD(String),
    MKD(String),
    /// `SITE CHMOD`; `quoted` wraps the name for servers that split on spaces.
    CHMOD { mode: u32, name: String, quoted: bool },
    NOOP,
    ABOR,
    QUIT,
    /// Text typed by the user or taken from the init commands.
    Raw(String),
}

impl FtpCommand {
    /// Command text without the line terminator.
    pub fn text(&self) -> String {
        match self {
            FtpCommand::USER(user) => format!("USER {}", user),
            FtpCommand::PASS(password) => format!("PASS {}", password),
            FtpCommand::ACCT(account) => format!("ACCT {}", account),
            FtpCommand::AUTH => "AUTH TLS".to_string(),
            FtpCommand::PBSZ => "PBSZ 0".to_string(),
            FtpCommand::PROT(private) => format!("PROT {}", if *private { "P" } else { "C" }),
            FtpCommand::SYST => "SYST".to_string(),
            FtpCommand::PWD => "PWD".to_string(),
            FtpCommand::CWD(path) => format!("CWD {}", path),
            FtpCommand::CDUP => "CDUP".to_string(),
            FtpCommand::TYPE(kind) => format!("TYPE {}", kind.code()),
            FtpCommand::MODE(compressed) => format!("MODE {}", if *compressed { "Z" } else { "S" }),
            FtpCommand::PASV => "PASV".to_string(),
            FtpCommand::PORT(arg) => format!("PORT {}", arg),
            FtpCommand::LIST(command, Some(path)) => format!("{} {}", command, path),
            FtpCommand::LIST(command, None) => command.clone(),
            FtpCommand::RETR(name) => format!("RETR {}", name),
            FtpCommand::STOR(name) => format!("STOR {}", name),
            FtpCommand::APPE(name) => format!("APPE {}", name),
            FtpCommand::REST(offset) => format!("REST {}", offset),
            FtpCommand::SIZE(name) => format!("SIZE {}", name),
            FtpCommand::DELE(name) => format!("DELE {}", name),
            FtpCommand::RMD(name) => format!("RMD {}", name),
            FtpCommand::MKD(name) => format!("MKD {}", name),
            FtpCommand::CHMOD { mode, name, quoted } => {
                if *quoted {
                    format!("SITE CHMOD {:03o} \"{}\"", mode, name.replace('"', "\\\""))
                } else {
                    format!("SITE CHMOD {:03o} {}", mode, name)
                }
            }
            FtpCommand::NOOP => "NOOP".to_string(),
            FtpCommand::ABOR => "ABOR".to_string(),
            FtpCommand::QUIT => "QUIT".to_string(),
            FtpCommand::Raw(text) => text.clone(),
        }
    }

    /// The CRLF terminated line written to the socket.
    pub fn to_wire(&self) -> Vec<u8> {
        let mut line = self.text().into_bytes();
        line.extend_from_slice(b"\r\n");
        line
    }

    /// What goes to the logs: never the password.
    pub fn log_text(&self) -> String {
        match self {
            FtpCommand::PASS(_) => "PASS ********".to_string(),
            FtpCommand::ACCT(_) => "ACCT ********".to_string(),
            other => other.text(),
        }
    }

    /// Whether the server's working directory may differ after this command.
    pub fn invalidates_working_path(&self) -> bool {
        matches!(self, FtpCommand::CWD(_) | FtpCommand::CDUP | FtpCommand::Raw(_))
    }

    /// Whether the server's transfer type may differ after this command.
    pub fn invalidates_transfer_mode(&self) -> bool {
        matches!(self, FtpCommand::Raw(_))
    }
}

impl fmt::Display for FtpCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.log_text())
    }
}

/// Splits the configured init commands (`;` separated) into raw commands.
pub fn split_init_commands(init: &str) -> Vec<FtpCommand> {
    init.split(';')
        .map(str::trim)
        .filter(|cmd| !cmd.is_empty())
        .map(|cmd| FtpCommand::Raw(cmd.to_string()))
        .collect()
}
