// Analyse des listings LIST : lignes Unix `ls -l` et DOS/IIS
// Les lignes `total`, les bannières, `.` et `..` sont ignorées

use regex::Regex;
use std::sync::OnceLock;

const UNIX_PATTERN: &str = r"(?x)
    ^([dlcbps-])([rwxsStT-]{9})[+@.]?\s+  # type, permissions
    \d+\s+                                # link count
    \S+\s+                                # owner
    (?:\S+\s+)?                           # group
    (\d+)\s+                              # size
    (\w{3}\s+\d{1,2}\s+[\d:]+)\s           # date
    (.+)$                                 # name, possibly `-> target`
";
const DOS_PATTERN: &str = r"(?x)
    ^(\d{2}-\d{2}-\d{2,4})\s+             # date
    (\d{1,2}:\d{2}\s?(?:AM|PM)?)\s+       # time
    (<DIR>|\d+)\s+                        # size or <DIR>
    (.+)$                                 # name
";

fn unix_regex() -> Option<&'static Regex> {
    static UNIX_RE: OnceLock<Option<Regex>> = OnceLock::new();
    UNIX_RE.get_or_init(|| Regex::new(UNIX_PATTERN).ok()).as_ref()
}

fn dos_regex() -> Option<&'static Regex> {
    static DOS_RE: OnceLock<Option<Regex>> = OnceLock::new();
    DOS_RE.get_or_init(|| Regex::new(DOS_PATTERN).ok()).as_ref()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Link,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: u64,
    pub link_target: Option<String>,
    /// Permission bits from a Unix listing.
    pub mode: Option<u32>,
}

pub fn parse_listing(raw: &[u8]) -> Vec<ListingEntry> {
    String::from_utf8_lossy(raw)
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| parse_unix(line).or_else(|| parse_dos(line)))
        .filter(|entry| entry.name != "." && entry.name != "..")
        .collect()
}

fn permission_bits(perms: &str) -> u32 {
    let b = perms.as_bytes();
    let mut mode = 0u32;
    for (i, &c) in b.iter().enumerate().take(9) {
        let set = !matches!(c, b'-' | b'S' | b'T');
        if set {
            mode |= 1 << (8 - i);
        }
    }
    // setuid / setgid / sticky
    if matches!(b.get(2), Some(b's' | b'S')) {
        mode |= 0o4000;
    }
    if matches!(b.get(5), Some(b's' | b'S')) {
        mode |= 0o2000;
    }
    if matches!(b.get(8), Some(b't' | b'T')) {
        mode |= 0o1000;
    }
    mode
}

fn parse_unix(line: &str) -> Option<ListingEntry> {
    let caps = unix_regex()?.captures(line)?;
    let kind = match caps.get(1)?.as_str() {
        "d" => EntryKind::Directory,
        "l" => EntryKind::Link,
        _ => EntryKind::File,
    };
    let mode = Some(permission_bits(caps.get(2)?.as_str()));
    let size = caps.get(3)?.as_str().parse().unwrap_or(0);
    let raw_name = caps.get(5)?.as_str();

    let (name, link_target) = match (kind, raw_name.find(" -> ")) {
        (EntryKind::Link, Some(pos)) => (
            raw_name[..pos].to_string(),
            Some(raw_name[pos + 4..].to_string()),
        ),
        _ => (raw_name.to_string(), None),
    };
    Some(ListingEntry {
        name,
        kind,
        size,
        link_target,
        mode,
    })
}

fn parse_dos(line: &str) -> Option<ListingEntry> {
    let caps = dos_regex()?.captures(line)?;
    let size_or_dir = caps.get(3)?.as_str();
    let (kind, size) = if size_or_dir == "<DIR>" {
        (EntryKind::Directory, 0)
    } else {
        (EntryKind::File, size_or_dir.parse().unwrap_or(0))
    };
    Some(ListingEntry {
        name: caps.get(4)?.as_str().to_string(),
        kind,
        size,
        link_target: None,
        mode: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unix_listing() {
        let raw = b"total 12\r\n\
drwxr-xr-x   2 root root  4096 Mar  1 09:30 .\r\n\
drwxr-xr-x   2 root root  4096 Mar  1 09:30 ..\r\n\
-rw-r--r--   1 user group  1234 Jan  1  2025 read me.txt\r\n\
drwxr-xr-x   2 root root  4096 Mar  1 09:30 subdir\r\n\
lrwxrwxrwx   1 root root    22 Jan  5 08:00 link -> /var/target\r\n";
        let entries = parse_listing(raw);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].name, "read me.txt");
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].size, 1234);
        assert_eq!(entries[0].mode, Some(0o644));
        assert_eq!(entries[1].kind, EntryKind::Directory);
        assert_eq!(entries[2].kind, EntryKind::Link);
        assert_eq!(entries[2].name, "link");
        assert_eq!(entries[2].link_target.as_deref(), Some("/var/target"));
    }

    #[test]
    fn test_dos_listing() {
        let raw = b"01-01-26  12:00AM       1234 file.txt\n01-01-26  12:00PM      <DIR> Directory Name\n";
        let entries = parse_listing(raw);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].size, 1234);
        assert_eq!(entries[1].kind, EntryKind::Directory);
        assert_eq!(entries[1].name, "Directory Name");
    }

    #[test]
    fn test_special_bits() {
        assert_eq!(permission_bits("rwsr-sr-t"), 0o7755);
        assert_eq!(permission_bits("rw-r--r-T"), 0o1644);
    }
}
