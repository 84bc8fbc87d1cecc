use crate::core_error::FtpError;
use crate::core_reply::reply::FtpReply;
use regex::Regex;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::OnceLock;

const PASV_PATTERN: &str =
    r"(\d{1,3})\s*,\s*(\d{1,3})\s*,\s*(\d{1,3})\s*,\s*(\d{1,3})\s*,\s*(\d{1,3})\s*,\s*(\d{1,3})";
const DATA_SIZE_PATTERN: &str = r"\((\d+)\s+[A-Za-z]+\)";

/// Longest line accepted before the peer is considered not to be an FTP server.
const MAX_REPLY_LINE: usize = 8192;

fn pasv_regex() -> Option<&'static Regex> {
    static PASV_RE: OnceLock<Option<Regex>> = OnceLock::new();
    PASV_RE.get_or_init(|| Regex::new(PASV_PATTERN).ok()).as_ref()
}

fn data_size_regex() -> Option<&'static Regex> {
    static SIZE_RE: OnceLock<Option<Regex>> = OnceLock::new();
    SIZE_RE.get_or_init(|| Regex::new(DATA_SIZE_PATTERN).ok()).as_ref()
}

fn reply_code(line: &str) -> Option<u16> {
    let digits = line.as_bytes().get(..3)?;
    if !digits.iter().all(u8::is_ascii_digit) || !(b'1'..=b'5').contains(&digits[0]) {
        return None;
    }
    line[..3].parse().ok()
}

fn ends_reply(line: &str) -> bool {
    matches!(line.as_bytes().get(3), Some(b' ') | None)
}

/// Removes one complete reply from the front of `buf`.
///
/// Lines may end with CRLF or a bare LF. A multi-line reply opens with `NNN-` and
/// closes at the first line starting with the same `NNN ` (or exactly `NNN`).
/// Returns `Ok(None)` while the reply is still incomplete; bytes of an incomplete
/// reply stay in `buf`.
pub fn take_reply(buf: &mut Vec<u8>) -> Result<Option<FtpReply>, FtpError> {
    let mut lines = Vec::new();
    let mut code: Option<u16> = None;
    let mut pos = 0;

    loop {
        let line_end = match buf[pos..].iter().position(|&b| b == b'\n') {
            Some(rel) => pos + rel,
            None => {
                if buf.len() - pos > MAX_REPLY_LINE {
                    let garbage = String::from_utf8_lossy(&buf[pos..pos + 80]).into_owned();
                    buf.clear();
                    return Err(FtpError::MalformedReply(garbage));
                }
                return Ok(None);
            }
        };
        let mut raw = &buf[pos..line_end];
        if raw.last() == Some(&b'\r') {
            raw = &raw[..raw.len() - 1];
        }
        let line = String::from_utf8_lossy(raw).into_owned();
        pos = line_end + 1;

        match code {
            None => {
                let Some(first_code) = reply_code(&line) else {
                    buf.drain(..pos);
                    return Err(FtpError::MalformedReply(line));
                };
                if line.as_bytes().get(3) == Some(&b'-') {
                    code = Some(first_code);
                    lines.push(line);
                } else if ends_reply(&line) {
                    lines.push(line);
                    buf.drain(..pos);
                    return FtpReply::new(first_code, lines)
                        .map(Some)
                        .ok_or_else(|| FtpError::MalformedReply(first_code.to_string()));
                } else {
                    buf.drain(..pos);
                    return Err(FtpError::MalformedReply(line));
                }
            }
            Some(multi_code) => {
                let last = reply_code(&line) == Some(multi_code) && ends_reply(&line);
                lines.push(line);
                if last {
                    buf.drain(..pos);
                    return FtpReply::new(multi_code, lines)
                        .map(Some)
                        .ok_or_else(|| FtpError::MalformedReply(multi_code.to_string()));
                }
            }
        }
    }
}

/// Extracts the data endpoint from a `227 Entering Passive Mode (h1,h2,h3,h4,p1,p2)` reply.
pub fn parse_pasv_reply(reply: &FtpReply) -> Option<SocketAddrV4> {
    let text = reply.text();
    let caps = pasv_regex()?.captures(text.get(4..)?)?;
    let mut parts = [0u8; 6];
    for (i, part) in parts.iter_mut().enumerate() {
        *part = caps.get(i + 1)?.as_str().parse::<u8>().ok()?;
    }
    let ip = Ipv4Addr::new(parts[0], parts[1], parts[2], parts[3]);
    let port = (parts[4] as u16) << 8 | parts[5] as u16;
    Some(SocketAddrV4::new(ip, port))
}

/// Renders the argument of a PORT command.
pub fn format_port_argument(addr: SocketAddrV4) -> String {
    let [h1, h2, h3, h4] = addr.ip().octets();
    format!(
        "{},{},{},{},{},{}",
        h1,
        h2,
        h3,
        h4,
        addr.port() >> 8,
        addr.port() & 0xFF
    )
}

/// Extracts the directory from a 257 reply.
///
/// Handles the regular `257 "dir ""quoted"" name" comment` form, servers that put
/// text before the quoted name, and servers that use single quotes around a path
/// containing no double quote after it.
pub fn parse_pwd_reply(reply: &FtpReply) -> Option<String> {
    let first = reply.lines.first()?;
    let rest = first.get(4..)?;
    let start = rest.find(['"', '\''])?;
    let rest = &rest[start..];

    if let Some(quoted) = rest.strip_prefix('\'') {
        if let Some(last) = quoted.rfind('\'') {
            if !quoted[last..].contains('"') {
                return Some(quoted[..last].to_string());
            }
        }
    }

    let quoted = &rest[rest.find('"')? + 1..];
    let mut dir = String::new();
    let mut chars = quoted.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '"' {
            if chars.peek() == Some(&'"') {
                chars.next();
            } else {
                return Some(dir);
            }
        }
        dir.push(c);
    }
    None
}

/// Reads the announced transfer size from a `150 Opening ... (1234 bytes)` reply.
pub fn parse_data_size(reply: &FtpReply) -> Option<u64> {
    let text = reply.text();
    let caps = data_size_regex()?.captures(&text)?;
    caps.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core_reply::ReplyClass;

    fn reply(code: u16, text: &str) -> FtpReply {
        FtpReply::new(code, vec![format!("{} {}", code, text)]).unwrap()
    }

    #[test]
    fn test_single_line_crlf_and_lf() {
        let mut buf = b"220 Welcome\r\n331 Password\n".to_vec();
        let first = take_reply(&mut buf).unwrap().unwrap();
        assert_eq!(first.code, 220);
        assert_eq!(first.message(), "Welcome");
        let second = take_reply(&mut buf).unwrap().unwrap();
        assert_eq!(second.class(), ReplyClass::Intermediate);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_multi_line_reply() {
        let mut buf = b"230-Welcome\r\n230-  230 is not the end\r\n 230 neither\r\n230 Logged in\r\n".to_vec();
        let reply = take_reply(&mut buf).unwrap().unwrap();
        assert_eq!(reply.code, 230);
        assert_eq!(reply.lines.len(), 4);
        assert_eq!(reply.message(), "Logged in");
    }

    #[test]
    fn test_incomplete_reply_stays_buffered() {
        let mut buf = b"211-Features:\r\n MDTM\r\n".to_vec();
        assert!(take_reply(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"211 End\r\n");
        let reply = take_reply(&mut buf).unwrap().unwrap();
        assert_eq!(reply.lines, vec!["211-Features:", " MDTM", "211 End"]);
    }

    #[test]
    fn test_bare_code_line() {
        let mut buf = b"200\r\n".to_vec();
        assert_eq!(take_reply(&mut buf).unwrap().unwrap().code, 200);
    }

    #[test]
    fn test_malformed_line_is_consumed() {
        let mut buf = b"hello there\r\n200 OK\r\n".to_vec();
        assert!(matches!(take_reply(&mut buf), Err(FtpError::MalformedReply(_))));
        assert_eq!(take_reply(&mut buf).unwrap().unwrap().code, 200);
    }

    #[test]
    fn test_parse_pasv() {
        let addr = parse_pasv_reply(&reply(227, "Entering Passive Mode (192,168,1,10,195,80).")).unwrap();
        assert_eq!(addr, "192.168.1.10:50000".parse().unwrap());
        let spaced = parse_pasv_reply(&reply(227, "=10, 0, 0, 1, 4, 1")).unwrap();
        assert_eq!(spaced.port(), 1025);
        assert!(parse_pasv_reply(&reply(227, "Entering Passive Mode (300,1,1,1,1,1)")).is_none());
    }

    #[test]
    fn test_format_port() {
        let addr: SocketAddrV4 = "10.0.0.5:50000".parse().unwrap();
        assert_eq!(format_port_argument(addr), "10,0,0,5,195,80");
    }

    #[test]
    fn test_parse_pwd() {
        assert_eq!(parse_pwd_reply(&reply(257, "\"/pub\" is current directory.")).as_deref(), Some("/pub"));
        assert_eq!(parse_pwd_reply(&reply(257, "\"/a \"\"b\"\"\" ok")).as_deref(), Some("/a \"b\""));
        assert_eq!(parse_pwd_reply(&reply(257, "Current directory is \"mars:\"")).as_deref(), Some("mars:"));
        assert_eq!(parse_pwd_reply(&reply(257, "'/proj/a'g' ist das aktuelle Verzeichnis.")).as_deref(), Some("/proj/a'g"));
        assert_eq!(parse_pwd_reply(&reply(257, "\"unterminated")), None);
    }

    #[test]
    fn test_parse_data_size() {
        assert_eq!(parse_data_size(&reply(150, "Opening BINARY mode data connection for a.bin (1234 bytes).")), Some(1234));
        assert_eq!(parse_data_size(&reply(150, "Opening data connection.")), None);
    }
}
