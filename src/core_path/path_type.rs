// Syntaxe des chemins côté serveur, détectée une fois par connexion

use crate::core_reply::FtpReply;
use serde::{Deserialize, Serialize};

const KNOWN_OS_NAMES: &[&str] = &[
    "UNIX", "Windows", "NETWARE", "TANDEM", "OS/2", "VMS", "MVS", "VM", "OS/400",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerPathType {
    #[default]
    Unknown,
    Unix,
    Windows,
    Netware,
    Os2,
    OpenVms,
    Mvs,
    IbmZVm,
    Tandem,
    As400,
}

fn is_slash(b: u8) -> bool {
    b == b'/' || b == b'\\'
}

/// An odd number of `^` in front of a character escapes it.
fn vms_escaped(path: &[u8], idx: usize) -> bool {
    path[..idx].iter().rev().take_while(|&&b| b == b'^').count() % 2 == 1
}

fn eq_ci(a: &[u8], b: &[u8]) -> bool {
    a.eq_ignore_ascii_case(b)
}

fn has_substring(text: &str, sub: &str) -> bool {
    text.to_ascii_lowercase().contains(&sub.to_ascii_lowercase())
}

fn concat(parts: &[&[u8]]) -> String {
    let bytes: Vec<u8> = parts.concat();
    String::from_utf8_lossy(&bytes).into_owned()
}

impl ServerPathType {
    pub fn delimiter(self) -> char {
        match self {
            ServerPathType::Tandem
            | ServerPathType::IbmZVm
            | ServerPathType::OpenVms
            | ServerPathType::Mvs => '.',
            _ => '/',
        }
    }

    pub fn is_case_sensitive(self) -> bool {
        self == ServerPathType::Unix
    }

    pub fn is_same_path(self, a: &str, b: &str) -> bool {
        self.prefix_match(a.as_bytes(), b.as_bytes(), true)
    }

    /// True when `path` is `prefix` itself or lies below it.
    pub fn is_prefix_path(self, prefix: &str, path: &str) -> bool {
        self.prefix_match(prefix.as_bytes(), path.as_bytes(), false)
    }

    fn prefix_match(self, prefix: &[u8], path: &[u8], must_be_same: bool) -> bool {
        match self {
            ServerPathType::OpenVms => {
                let trim = |p: &[u8]| {
                    let mut l = p.len();
                    if l > 1 && p[l - 1] == b']' && !vms_escaped(p, l - 1) {
                        l -= 1;
                        if p[l - 1] == b'.' && !vms_escaped(p, l - 1) {
                            l -= 1;
                        }
                        if l >= 7 && &p[l - 7..l] == b"[000000" && !vms_escaped(p, l - 7) {
                            l -= 6;
                        }
                    }
                    l
                };
                let (l1, l2) = (trim(prefix), trim(path));
                (l1 == l2 || !must_be_same && l1 < l2)
                    && eq_ci(&prefix[..l1], &path[..l1])
                    && (l1 == l2
                        || l1 > 0 && prefix[l1 - 1] == b'[' && !vms_escaped(prefix, l1 - 1)
                        || (path[l1] == b'.' || path[l1] == b']') && !vms_escaped(path, l1))
            }
            ServerPathType::Mvs => {
                let trim = |p: &[u8]| {
                    let mut l = p.len();
                    if l > 1 && p[l - 1] == b'\'' {
                        l -= 1;
                        if p[l - 1] == b'.' {
                            l -= 1;
                        }
                    }
                    l
                };
                let (l1, l2) = (trim(prefix), trim(path));
                (l1 == l2 || !must_be_same && l1 < l2)
                    && eq_ci(&prefix[..l1], &path[..l1])
                    && (l1 == l2 || path[l1] == b'.' || path[l1] == b'\'')
            }
            ServerPathType::Netware | ServerPathType::Windows | ServerPathType::Os2 => {
                Self::walk_match(prefix, path, must_be_same, is_slash)
            }
            ServerPathType::As400 => Self::walk_match(prefix, path, must_be_same, |b| b == b'/'),
            ServerPathType::IbmZVm | ServerPathType::Tandem => {
                let trim = |p: &[u8]| {
                    if p.len() > 1 && p[p.len() - 1] == b'.' {
                        p.len() - 1
                    } else {
                        p.len()
                    }
                };
                let (l1, l2) = (trim(prefix), trim(path));
                (l1 == l2 || !must_be_same && l1 < l2)
                    && eq_ci(&prefix[..l1], &path[..l1])
                    && (l1 == l2 || path[l1] == b'.')
            }
            ServerPathType::Unix | ServerPathType::Unknown => {
                let trim = |p: &[u8]| {
                    if p.last() == Some(&b'/') {
                        p.len() - 1
                    } else {
                        p.len()
                    }
                };
                let (l1, l2) = (trim(prefix), trim(path));
                (l1 == l2 || !must_be_same && l1 < l2)
                    && prefix[..l1] == path[..l1]
                    && (l1 == l2 || path[l1] == b'/')
            }
        }
    }

    /// Case-insensitive walk where every byte accepted by `sep` matches every other.
    fn walk_match(prefix: &[u8], path: &[u8], must_be_same: bool, sep: fn(u8) -> bool) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < prefix.len()
            && j < path.len()
            && (sep(prefix[i]) && sep(path[j]) || prefix[i].eq_ignore_ascii_case(&path[j]))
        {
            i += 1;
            j += 1;
        }
        if i < prefix.len() && sep(prefix[i]) {
            i += 1;
        }
        if j < path.len() && sep(path[j]) {
            j += 1;
        }
        i == prefix.len() && j == path.len()
            || !must_be_same && i == prefix.len() && j > 0 && sep(path[j - 1])
    }

    /// Appends a file or directory name to `path`.
    ///
    /// Returns `None` when `path` does not have the shape this path type needs.
    pub fn append(self, path: &str, name: &str, is_dir: bool) -> Option<String> {
        let p = path.as_bytes();
        let n = name.as_bytes();
        let l = p.len();
        match self {
            ServerPathType::OpenVms => {
                if !(l > 1 && p[l - 1] == b']' && !vms_escaped(p, l - 1)) {
                    return None;
                }
                let mut s = l - 1;
                if p[s - 1] == b'.' && !vms_escaped(p, s - 1) {
                    s -= 1;
                }
                if n.is_empty() {
                    return Some(concat(&[&p[..s], b"]"]));
                }
                let in_root = is_dir && s >= 7 && &p[s - 7..s] == b"[000000" && !vms_escaped(p, s - 7);
                if is_dir {
                    if in_root {
                        Some(concat(&[&p[..s - 6], n, b"]"]))
                    } else {
                        Some(concat(&[&p[..s], b".", n, b"]"]))
                    }
                } else {
                    Some(concat(&[&p[..s], b"]", n]))
                }
            }
            ServerPathType::Mvs => {
                if !(l > 1 && p[l - 1] == b'\'') {
                    return None;
                }
                let mut s = l - 1;
                if p[s - 1] == b'.' {
                    s -= 1;
                }
                if n.is_empty() {
                    return Some(concat(&[&p[..s], b"'"]));
                }
                let root = s >= 1 && p[s - 1] == b'\'';
                let dot: &[u8] = if root { b"" } else { b"." };
                Some(concat(&[&p[..s], dot, n, b"'"]))
            }
            ServerPathType::IbmZVm | ServerPathType::Tandem => {
                if l == 0 {
                    return None;
                }
                if n.is_empty() {
                    return Some(path.to_string());
                }
                let dot: &[u8] = if p[l - 1] != b'.' { b"." } else { b"" };
                Some(concat(&[p, dot, n]))
            }
            _ => {
                let mut slash = b'/';
                let mut end = l;
                let dos_like = matches!(
                    self,
                    ServerPathType::Netware | ServerPathType::Windows | ServerPathType::Os2
                );
                if dos_like {
                    if l > 0 && is_slash(p[l - 1]) {
                        slash = p[l - 1];
                        end -= 1;
                    }
                } else if l > 0 && p[l - 1] == b'/' {
                    end -= 1;
                }
                if !n.is_empty() {
                    if l == 0 {
                        return Some(name.to_string());
                    }
                    return Some(concat(&[&p[..end], &[slash], n]));
                }
                let keep = if self == ServerPathType::Os2 { 2 } else { 0 };
                if end > keep {
                    Some(concat(&[&p[..end]]))
                } else {
                    Some(path.to_string())
                }
            }
        }
    }

    /// Splits the last component off `path`: `(parent, last)`.
    ///
    /// `None` for a root path or a path this type cannot split.
    pub fn cut_last(self, path: &str) -> Option<(String, String)> {
        let p = path.as_bytes();
        let l = p.len();
        if l == 0 {
            return None;
        }
        match self {
            ServerPathType::OpenVms => {
                let s = l - 1;
                let mut name = s;
                while name > 0 && (p[name] != b']' || vms_escaped(p, name)) {
                    name -= 1;
                }
                if name < s && name > 0 {
                    return Some((concat(&[&p[..=name]]), concat(&[&p[name + 1..]])));
                }
                if !(l > 1 && p[s] == b']' && !vms_escaped(p, s)) {
                    return None;
                }
                let mut end = s;
                let mut s = s;
                if p[s - 1] == b'.' && !vms_escaped(p, s - 1) {
                    s -= 1;
                    end = s;
                }
                loop {
                    if s == 0 {
                        return None;
                    }
                    s -= 1;
                    if (p[s] == b'.' || p[s] == b'[') && !vms_escaped(p, s) {
                        break;
                    }
                }
                if p[s] == b'.' {
                    Some((concat(&[&p[..s], b"]"]), concat(&[&p[s + 1..end]])))
                } else {
                    let tail = &p[s + 1..];
                    let is_root = tail.starts_with(b"000000")
                        && matches!(tail.get(6), Some(b'.') | Some(b']'));
                    if is_root {
                        None
                    } else {
                        Some((concat(&[&p[..=s], b"000000]"]), concat(&[&p[s + 1..end]])))
                    }
                }
            }
            ServerPathType::Mvs => {
                if !(l > 1 && p[l - 1] == b'\'') {
                    return None;
                }
                let mut s = l - 1;
                let mut end = s;
                if p[s - 1] == b'.' {
                    s -= 1;
                    end = s;
                }
                let found = p[..s].iter().rposition(|&b| b == b'.' || b == b'\'')?;
                if p[found] == b'.' || found + 1 < end {
                    let cut = concat(&[&p[found + 1..end]]);
                    let parent = if p[found] == b'\'' {
                        concat(&[&p[..=found], b"'"])
                    } else {
                        concat(&[&p[..found], b"'"])
                    };
                    Some((parent, cut))
                } else {
                    None
                }
            }
            ServerPathType::Tandem => {
                let last_dot = p[..l - 1].iter().rposition(|&b| b == b'.')?;
                let end = if p[l - 1] == b'.' { l - 1 } else { l };
                Some((concat(&[&p[..last_dot]]), concat(&[&p[last_dot + 1..end]])))
            }
            ServerPathType::IbmZVm => {
                let last = p.iter().rposition(|&b| b == b'.');
                let prev = last.and_then(|last| p[..last].iter().rposition(|&b| b == b'.'));
                let mut will_be_root = false;
                if prev.is_none() {
                    match last {
                        Some(last) if last + 1 != l => will_be_root = true,
                        _ => return None,
                    }
                }
                let (start, end) = if p[l - 1] == b'.' {
                    let prev = prev?;
                    if !p[..prev].contains(&b'.') {
                        will_be_root = true;
                    }
                    (prev, l - 1)
                } else {
                    (last?, l)
                };
                let parent_end = start + usize::from(will_be_root);
                Some((concat(&[&p[..parent_end]]), concat(&[&p[start + 1..end]])))
            }
            _ => {
                let sep: fn(u8) -> bool = match self {
                    ServerPathType::Windows | ServerPathType::Netware | ServerPathType::Os2 => is_slash,
                    _ => |b| b == b'/',
                };
                let last_slash = p[..l - 1].iter().rposition(|&b| sep(b))?;
                let prev_slash = p[..last_slash].iter().rposition(|&b| sep(b));
                let end = if sep(p[l - 1]) { l - 1 } else { l };
                let cut = concat(&[&p[last_slash + 1..end]]);
                let parent = match prev_slash {
                    None => concat(&[&p[..=last_slash]]),
                    Some(_) => concat(&[&p[..last_slash]]),
                };
                Some((parent, cut))
            }
        }
    }

    /// Guesses the path syntax from the first working path, the SYST reply and the greeting.
    pub fn detect(greeting: Option<&str>, syst_reply: Option<&str>, path: &str) -> ServerPathType {
        let p = path.as_bytes();
        let mut slash = 0;
        let mut slash_at_beg = 0;
        let mut backslash = 0;
        let mut backslash_at_beg = 0;
        let mut apostroph = 0;
        let mut apostroph_at_beg = 0;
        let mut apostroph_at_end = 0;
        let mut bracket = 0;
        let mut escaped_bracket = 0;
        let mut open_bracket = 0;
        let mut escaped_open_bracket = 0;
        let mut close_bracket = 0;
        let mut escaped_close_bracket = 0;
        let mut colon = 0;
        let mut periods_after_colon = 0;
        let mut periods_before_colon = 0;
        let mut spaces = 0;
        let mut colon_on_second_pos = false;
        let char_on_first_pos = p.first().map_or(false, |b| b.is_ascii_alphabetic());
        let mut vms_escape = false;

        for (i, &c) in p.iter().enumerate() {
            if c == b'^' {
                vms_escape = !vms_escape;
                continue;
            }
            match c {
                b'/' if i == 0 => slash_at_beg += 1,
                b'/' => slash += 1,
                b'\\' if i == 0 => backslash_at_beg += 1,
                b'\\' => backslash += 1,
                b'\'' if i == 0 => apostroph_at_beg += 1,
                b'\'' if i + 1 == p.len() => apostroph_at_end += 1,
                b'\'' => apostroph += 1,
                b'[' if i == 0 || p[i - 1] == b':' => {
                    open_bracket += 1;
                    if vms_escape {
                        escaped_open_bracket += 1;
                    }
                }
                b'[' => {
                    bracket += 1;
                    if vms_escape {
                        escaped_bracket += 1;
                    }
                }
                b']' => {
                    // skip a trailing file name such as "DKA0:[MYDIR.SUBDIR]MYFILE.TXT;1"
                    let mut esc = false;
                    let mut at_end = true;
                    for &n in &p[i + 1..] {
                        if n == b'/' || n == b'\\' {
                            at_end = false;
                            break;
                        }
                        if n == b'^' {
                            esc = !esc;
                        } else if esc {
                            esc = false;
                        } else if n == b'[' || n == b']' {
                            at_end = false;
                            break;
                        }
                    }
                    if at_end {
                        close_bracket += 1;
                        if vms_escape {
                            escaped_close_bracket += 1;
                        }
                    } else {
                        bracket += 1;
                        if vms_escape {
                            escaped_bracket += 1;
                        }
                    }
                }
                b':' => {
                    colon += 1;
                    if i == 1 {
                        colon_on_second_pos = true;
                    }
                }
                b'.' if colon > 0 => periods_after_colon += 1,
                b'.' => periods_before_colon += 1,
                b' ' => spaces += 1,
                _ => {}
            }
            vms_escape = false;
        }

        let sys_name = syst_reply.map(server_system_name).unwrap_or_default();
        let greeting = greeting.unwrap_or("");
        let hellsoft = has_substring(greeting, " NW 3") && has_substring(greeting, " HellSoft");
        let netware = has_substring(&sys_name, "NETWARE") || hellsoft;
        let tandem = has_substring(greeting, " TANDEM ")
            && (sys_name.is_empty() || has_substring(&sys_name, "TANDEM"));

        if slash_at_beg > 0 {
            if has_substring(&sys_name, "Windows") {
                return ServerPathType::Windows;
            }
            if netware {
                return ServerPathType::Netware;
            }
            if has_substring(&sys_name, "OS/400") {
                return ServerPathType::As400;
            }
            return ServerPathType::Unix;
        }
        if backslash_at_beg > 0 {
            if netware {
                return ServerPathType::Netware;
            }
            if slash == 0 && backslash == 0 && tandem {
                return ServerPathType::Tandem;
            }
            return ServerPathType::Windows;
        }
        if char_on_first_pos
            && colon_on_second_pos
            && colon == 1
            && (p.len() == 2 || slash > 0 || backslash > 0)
        {
            return ServerPathType::Os2;
        }
        if open_bracket - escaped_open_bracket == 1
            && close_bracket - escaped_close_bracket == 1
            && bracket - escaped_bracket == 0
            && apostroph_at_beg + apostroph_at_end == 0
            && slash_at_beg + slash + backslash_at_beg + backslash == 0
        {
            return ServerPathType::OpenVms;
        }
        if apostroph_at_beg > 0 && apostroph_at_end > 0 && apostroph == 0 {
            return ServerPathType::Mvs;
        }
        if slash == 0
            && backslash == 0
            && colon == 1
            && periods_after_colon > 0
            && periods_before_colon == 0
            && spaces == 0
        {
            return ServerPathType::IbmZVm;
        }
        if p.is_empty() {
            if has_substring(&sys_name, "UNIX") {
                return ServerPathType::Unix;
            }
            if has_substring(&sys_name, "Windows") {
                return ServerPathType::Windows;
            }
            if netware {
                return ServerPathType::Netware;
            }
            if has_substring(&sys_name, "OS/2") {
                return ServerPathType::Os2;
            }
            if has_substring(&sys_name, "VMS") {
                return ServerPathType::OpenVms;
            }
            if has_substring(&sys_name, "MVS") {
                return ServerPathType::Mvs;
            }
            if has_substring(&sys_name, "VM") {
                return ServerPathType::IbmZVm;
            }
            if tandem {
                return ServerPathType::Tandem;
            }
        }
        if has_substring(&sys_name, "OS/400") {
            return ServerPathType::As400;
        }
        ServerPathType::Unknown
    }
}

/// Operating system name announced by a SYST reply ("UNIX" from "215 UNIX Type: L8").
pub fn server_system_name(syst_reply: &str) -> String {
    if !syst_reply.starts_with('2') || syst_reply.len() <= 4 {
        return String::new();
    }
    let last_line = syst_reply.lines().last().unwrap_or("");
    let words: Vec<&str> = last_line.get(4..).unwrap_or("").split_whitespace().collect();
    let known = |w: &str| KNOWN_OS_NAMES.iter().any(|os| os.eq_ignore_ascii_case(w));
    let name = match words.first().copied() {
        Some(first) if known(first) => first,
        Some(first) => words.iter().skip(1).copied().find(|w| known(w)).unwrap_or(first),
        None => "",
    };
    name.chars().take(200).collect()
}

/// Name of the directory file RMD expects on VMS: "SUB" becomes "SUB.DIR;1".
pub fn vms_dir_name(dir_name: &str) -> String {
    let b = dir_name.as_bytes();
    let base = if b.last() == Some(&b'.') && !vms_escaped(b, b.len() - 1) {
        &dir_name[..dir_name.len() - 1]
    } else {
        dir_name
    };
    format!("{}.DIR;1", base)
}

/// Some servers answer LIST on an empty directory with an error.
pub fn is_empty_listing_error(reply: &FtpReply) -> bool {
    let text = reply.lines.first().and_then(|l| l.get(4..)).unwrap_or("");
    let starts_ci = |prefix: &str| {
        text.len() >= prefix.len() && text.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
    };
    starts_ci("file not found") || starts_ci("The specified directory is empty")
}

#[cfg(test)]
mod tests {
    use super::*;
    use ServerPathType::*;

    #[test]
    fn test_unix_prefix() {
        assert!(Unix.is_prefix_path("/", "/pub/a"));
        assert!(Unix.is_prefix_path("/pub", "/pub/a"));
        assert!(Unix.is_prefix_path("/pub/", "/pub"));
        assert!(!Unix.is_prefix_path("/pub", "/public"));
        assert!(!Unix.is_prefix_path("/PUB", "/pub/a"));
        assert!(Unix.is_same_path("/pub/", "/pub"));
        assert!(!Unix.is_same_path("/pub", "/pub/a"));
    }

    #[test]
    fn test_windows_prefix() {
        assert!(Windows.is_prefix_path("/Pub", "\\pub\\a"));
        assert!(Windows.is_same_path("C:\\Data\\", "c:/data"));
        assert!(!Windows.is_prefix_path("/pub", "/public"));
        assert!(As400.is_prefix_path("/QSYS.LIB", "/qsys.lib/x.file"));
    }

    #[test]
    fn test_vms_prefix() {
        assert!(OpenVms.is_prefix_path("[PUB]", "[pub.vms]"));
        assert!(OpenVms.is_prefix_path("[000000]", "[PUB]"));
        assert!(!OpenVms.is_prefix_path("[PUB]", "[PUBLIC]"));
        assert!(OpenVms.is_same_path("[PUB.VMS.]", "[PUB.VMS]"));
    }

    #[test]
    fn test_mvs_and_dotted_prefix() {
        assert!(Mvs.is_prefix_path("'USER.'", "'USER.DATA.CLIST'"));
        assert!(!Mvs.is_prefix_path("'USER'", "'USERX.DATA'"));
        assert!(IbmZVm.is_prefix_path("ACCT:ROOT.", "acct:root.dir"));
        assert!(Tandem.is_prefix_path("\\SYS.$VOL", "\\SYS.$VOL.SUB"));
    }

    #[test]
    fn test_unix_cut_and_append() {
        assert_eq!(Unix.cut_last("/pub/a/"), Some(("/pub".into(), "a".into())));
        assert_eq!(Unix.cut_last("/pub"), Some(("/".into(), "pub".into())));
        assert_eq!(Unix.cut_last("/"), None);
        assert_eq!(Unix.append("/", "pub", true).as_deref(), Some("/pub"));
        assert_eq!(Unix.append("/pub/", "a.txt", false).as_deref(), Some("/pub/a.txt"));
        assert_eq!(Os2.append("C:/", "", true).as_deref(), Some("C:/"));
        assert_eq!(Windows.append("\\data\\", "x", false).as_deref(), Some("\\data\\x"));
    }

    #[test]
    fn test_vms_cut_and_append() {
        assert_eq!(OpenVms.cut_last("[PUB.VMS]"), Some(("[PUB]".into(), "VMS".into())));
        assert_eq!(OpenVms.cut_last("[PUB]"), Some(("[000000]".into(), "PUB".into())));
        assert_eq!(OpenVms.cut_last("[000000]"), None);
        assert_eq!(OpenVms.cut_last("[PUB]A.TXT;1"), Some(("[PUB]".into(), "A.TXT;1".into())));
        assert_eq!(OpenVms.append("[PUB]", "VMS", true).as_deref(), Some("[PUB.VMS]"));
        assert_eq!(OpenVms.append("[000000]", "PUB", true).as_deref(), Some("[PUB]"));
        assert_eq!(OpenVms.append("[PUB]", "A.TXT", false).as_deref(), Some("[PUB]A.TXT"));
        assert_eq!(OpenVms.append("/bad", "x", true), None);
    }

    #[test]
    fn test_mvs_cut_and_append() {
        assert_eq!(Mvs.cut_last("'PUB.MVS'"), Some(("'PUB'".into(), "MVS".into())));
        assert_eq!(Mvs.cut_last("'PUB'"), Some(("''".into(), "PUB".into())));
        assert_eq!(Mvs.cut_last("''"), None);
        assert_eq!(Mvs.append("''", "PUB", true).as_deref(), Some("'PUB'"));
        assert_eq!(Mvs.append("'PUB.'", "MVS", true).as_deref(), Some("'PUB.MVS'"));
    }

    #[test]
    fn test_dotted_cut() {
        assert_eq!(Tandem.cut_last("\\SYS.$VOL.SUB"), Some(("\\SYS.$VOL".into(), "SUB".into())));
        assert_eq!(Tandem.cut_last("\\SYS"), None);
        assert_eq!(IbmZVm.cut_last("A.B.C"), Some(("A.B".into(), "C".into())));
        assert_eq!(IbmZVm.cut_last("A.B."), Some(("A.".into(), "B".into())));
        assert_eq!(IbmZVm.cut_last("A."), None);
        assert_eq!(IbmZVm.append("A.", "B", true).as_deref(), Some("A.B"));
    }

    #[test]
    fn test_detect() {
        assert_eq!(ServerPathType::detect(None, Some("215 UNIX Type: L8"), "/home/u"), Unix);
        assert_eq!(ServerPathType::detect(None, Some("215 Windows_NT"), "/"), Windows);
        assert_eq!(ServerPathType::detect(None, None, "\\data"), Windows);
        assert_eq!(ServerPathType::detect(None, Some("215 NETWARE Type: L8"), "/sys"), Netware);
        assert_eq!(ServerPathType::detect(None, None, "C:/dir"), Os2);
        assert_eq!(ServerPathType::detect(None, Some("215 VMS"), "DKA0:[USER.DIR]"), OpenVms);
        assert_eq!(ServerPathType::detect(None, Some("215 MVS is the operating system"), "'USER.'"), Mvs);
        assert_eq!(ServerPathType::detect(None, Some("215 VM"), "ACCT:ROOT."), IbmZVm);
        assert_eq!(
            ServerPathType::detect(Some("220 sys1 FTP SERVER T9552 TANDEM (ready)"), None, "\\SYS1.$VOL"),
            Tandem
        );
        assert_eq!(ServerPathType::detect(None, Some("215 OS/400 is the remote system"), "QGPL"), As400);
        assert_eq!(ServerPathType::detect(None, Some("215 UNIX"), ""), Unix);
        assert_eq!(ServerPathType::detect(None, None, "weird"), Unknown);
    }

    #[test]
    fn test_system_name() {
        assert_eq!(server_system_name("215 UNIX Type: L8"), "UNIX");
        assert_eq!(server_system_name("215 Betriebssystem OS/2"), "OS/2");
        assert_eq!(server_system_name("215-Hello\n215 Windows_NT"), "Windows_NT");
        assert_eq!(server_system_name("500 unknown"), "");
    }

    #[test]
    fn test_vms_dir_name_and_empty_listing() {
        assert_eq!(vms_dir_name("SUB"), "SUB.DIR;1");
        assert_eq!(vms_dir_name("SUB."), "SUB.DIR;1");
        let reply = FtpReply::new(550, vec!["550 File not found.".into()]).unwrap();
        assert!(is_empty_listing_error(&reply));
        let reply = FtpReply::new(550, vec!["550 Permission denied.".into()]).unwrap();
        assert!(!is_empty_listing_error(&reply));
    }
}
