//! Location-string parsing: `path#k1=v1#k2=v2#...` (spec §4.3).
//!
//! Grounded on `tcadbopen()` in the original Tokyo Cabinet sources: a
//! `#`-split path followed by `key=value` tuning options, unknown keys
//! silently ignored, `path == "*"` selecting the in-memory back-end.

/// Parsed tuning parameters pulled out of a location string's option
/// tuples. Fields left at their sentinel ("unset") value fall back to
/// each back-end's own default when the store is opened.
#[derive(Debug, Clone)]
pub struct Tuning {
    pub bnum: u64,
    pub apow: i32,
    pub fpow: i32,
    pub opts: u8,
    pub rcnum: Option<usize>,
    pub xmsiz: Option<u64>,
    pub dfunit: Option<u32>,
    pub capnum: Option<u64>,
    pub capsiz: Option<u64>,

    pub mode_writer: bool,
    pub mode_create: bool,
    pub mode_trunc: bool,
    pub mode_nolock: bool,
    pub mode_nonblocking: bool,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            bnum: 0,
            apow: -1,
            fpow: -1,
            opts: 0,
            rcnum: None,
            xmsiz: None,
            dfunit: None,
            capnum: None,
            capsiz: None,
            mode_writer: false,
            mode_create: false,
            mode_trunc: false,
            mode_nolock: false,
            mode_nonblocking: false,
        }
    }
}

/// Which back-end a location string selects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Persistent(String),
}

pub struct Location {
    pub backend: Backend,
    pub tuning: Tuning,
}

/// Parse a location string of the form `path#bnum=100#mode=wc#opts=l`.
///
/// `path == "*"` selects the in-memory back-end; any other path is opened
/// against the persistent hash-file store. Unrecognized option keys are
/// ignored, matching `tcadbopen`'s tolerance for tokens meant for other
/// back-ends (e.g. the B-tree-only `lmemb`/`ncnum` keys).
pub fn parse(location: &str) -> Location {
    let mut parts = location.split('#');
    let path = parts.next().unwrap_or("").to_string();
    let mut tuning = Tuning::default();

    for tuple in parts {
        let mut kv = tuple.splitn(2, '=');
        let key = kv.next().unwrap_or("");
        let value = kv.next().unwrap_or("");
        match key {
            "bnum" => tuning.bnum = value.parse().unwrap_or(0),
            "apow" => tuning.apow = value.parse().unwrap_or(-1),
            "fpow" => tuning.fpow = value.parse().unwrap_or(-1),
            "rcnum" => tuning.rcnum = value.parse().ok(),
            "xmsiz" => tuning.xmsiz = value.parse().ok(),
            "dfunit" => tuning.dfunit = value.parse().ok(),
            "capnum" => tuning.capnum = value.parse().ok(),
            "capsiz" => tuning.capsiz = value.parse().ok(),
            "mode" => {
                for c in value.chars() {
                    match c {
                        'w' => tuning.mode_writer = true,
                        'c' => tuning.mode_create = true,
                        't' => tuning.mode_trunc = true,
                        'e' => tuning.mode_nolock = true,
                        'f' => tuning.mode_nonblocking = true,
                        _ => {}
                    }
                }
            }
            "opts" => {
                for c in value.chars() {
                    match c {
                        'l' => tuning.opts |= crate::persistent::header::OPT_LARGE,
                        'd' => tuning.opts |= crate::persistent::header::OPT_DEFLATE,
                        'b' => tuning.opts |= crate::persistent::header::OPT_BZIP2,
                        't' => tuning.opts |= crate::persistent::header::OPT_TCBS,
                        _ => {}
                    }
                }
            }
            _ => {} // tolerate keys meant for back-ends we don't implement
        }
    }

    let backend = if path == "*" {
        Backend::Memory
    } else {
        Backend::Persistent(path)
    };

    Location { backend, tuning }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_path() {
        let loc = parse("*");
        assert_eq!(loc.backend, Backend::Memory);
    }

    #[test]
    fn persistent_path_with_options() {
        let loc = parse("db.hdb#bnum=131071#apow=4#mode=wct#opts=ld#rcnum=1000");
        assert_eq!(loc.backend, Backend::Persistent("db.hdb".to_string()));
        assert_eq!(loc.tuning.bnum, 131071);
        assert_eq!(loc.tuning.apow, 4);
        assert!(loc.tuning.mode_writer && loc.tuning.mode_create && loc.tuning.mode_trunc);
        assert_eq!(loc.tuning.opts, crate::persistent::header::OPT_LARGE | crate::persistent::header::OPT_DEFLATE);
        assert_eq!(loc.tuning.rcnum, Some(1000));
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let loc = parse("db.hdb#lmemb=128#ncnum=512#bnum=99");
        assert_eq!(loc.tuning.bnum, 99);
    }
}
