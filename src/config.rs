//! Kernel command-line parsing: whitespace-separated `key=value` pairs,
//! consumed once at boot and stashed behind a `OnceCell` for later lookups
//! (`loglevel`, `term_driver`, `sched_policy`, `timekeeper.tsc_enable`, ...).

use alloc::string::{String, ToString};
use alloc::vec::Vec;
use conquer_once::spin::OnceCell;

pub struct CmdLine {
    entries: Vec<(String, String)>,
}

impl CmdLine {
    pub fn parse(raw: &str) -> Self {
        let mut entries = Vec::new();
        for token in raw.split_whitespace() {
            if let Some((k, v)) = token.split_once('=') {
                entries.push((k.to_string(), v.to_string()));
            } else if !token.is_empty() {
                entries.push((token.to_string(), String::new()));
            }
        }
        CmdLine { entries }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn get_u32(&self, key: &str) -> Option<u32> {
        self.get(key)?.parse().ok()
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key) {
            Some("0") => false,
            Some(_) => true,
            None => default,
        }
    }
}

static CMDLINE: OnceCell<CmdLine> = OnceCell::uninit();

pub fn init(raw: &str) {
    CMDLINE
        .try_init_once(|| CmdLine::parse(raw))
        .expect("command line already parsed");
}

pub fn get(key: &str) -> Option<&'static str> {
    CMDLINE.get().and_then(|c| c.get(key))
}

pub fn loglevel() -> u8 {
    CMDLINE
        .get()
        .and_then(|c| c.get_u32("loglevel"))
        .unwrap_or(5) as u8
}

pub fn sched_policy() -> &'static str {
    CMDLINE.get().and_then(|c| c.get("sched_policy")).unwrap_or("rr")
}

pub fn tsc_enabled() -> bool {
    CMDLINE
        .get()
        .map(|c| c.get_bool("timekeeper.tsc_enable", true))
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_key_value_pairs() {
        let cl = CmdLine::parse("loglevel=5 sched_policy=rr timekeeper.tsc_enable=0");
        assert_eq!(cl.get("loglevel"), Some("5"));
        assert_eq!(cl.get("sched_policy"), Some("rr"));
        assert_eq!(cl.get_bool("timekeeper.tsc_enable", true), false);
    }

    #[test]
    fn last_duplicate_key_wins() {
        let cl = CmdLine::parse("loglevel=3 loglevel=6");
        assert_eq!(cl.get("loglevel"), Some("6"));
    }
}
