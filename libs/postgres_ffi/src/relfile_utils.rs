//! Relation fork numbers and data-directory file naming.

use crate::pg_constants;

/// The four forks a relation file family can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ForkNumber {
    Main = pg_constants::MAIN_FORKNUM,
    Fsm = pg_constants::FSM_FORKNUM,
    VisibilityMap = pg_constants::VISIBILITYMAP_FORKNUM,
    Init = pg_constants::INIT_FORKNUM,
}

impl ForkNumber {
    pub fn from_u8(forknum: u8) -> Option<ForkNumber> {
        match forknum {
            pg_constants::MAIN_FORKNUM => Some(ForkNumber::Main),
            pg_constants::FSM_FORKNUM => Some(ForkNumber::Fsm),
            pg_constants::VISIBILITYMAP_FORKNUM => Some(ForkNumber::VisibilityMap),
            pg_constants::INIT_FORKNUM => Some(ForkNumber::Init),
            _ => None,
        }
    }

    /// The file name suffix, empty for the main fork.
    pub fn name(self) -> &'static str {
        match self {
            ForkNumber::Main => "",
            ForkNumber::Fsm => "fsm",
            ForkNumber::VisibilityMap => "vm",
            ForkNumber::Init => "init",
        }
    }
}

impl std::fmt::Display for ForkNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ForkNumber::Main => write!(f, "main"),
            ForkNumber::Fsm => write!(f, "fsm"),
            ForkNumber::VisibilityMap => write!(f, "vm"),
            ForkNumber::Init => write!(f, "init"),
        }
    }
}

/// Parse a data-directory relation file name of the form
/// `<relnumber>[_<fork>][.<segno>]` into its parts. Returns None for
/// files that are not relation data (`pg_filenode.map`, `PG_VERSION`,
/// CSV files dropped by tooling, ...).
pub fn parse_relfilename(fname: &str) -> Option<(u32, ForkNumber, u32)> {
    let (main, segno) = match fname.split_once('.') {
        Some((main, seg)) => (main, seg.parse::<u32>().ok()?),
        None => (fname, 0),
    };
    let (relnumber_str, fork) = match main.split_once('_') {
        Some((rel, forkname)) => {
            let fork = match forkname {
                "fsm" => ForkNumber::Fsm,
                "vm" => ForkNumber::VisibilityMap,
                "init" => ForkNumber::Init,
                _ => return None,
            };
            (rel, fork)
        }
        None => (main, ForkNumber::Main),
    };
    if relnumber_str.is_empty() || !relnumber_str.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let relnumber = relnumber_str.parse::<u32>().ok()?;
    Some((relnumber, fork, segno))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_relation_files() {
        assert_eq!(parse_relfilename("16384"), Some((16384, ForkNumber::Main, 0)));
        assert_eq!(parse_relfilename("16384_fsm"), Some((16384, ForkNumber::Fsm, 0)));
        assert_eq!(parse_relfilename("16384_vm"), Some((16384, ForkNumber::VisibilityMap, 0)));
        assert_eq!(parse_relfilename("16384_init"), Some((16384, ForkNumber::Init, 0)));
        assert_eq!(parse_relfilename("16384.2"), Some((16384, ForkNumber::Main, 2)));
        assert_eq!(parse_relfilename("16384_fsm.1"), Some((16384, ForkNumber::Fsm, 1)));

        assert_eq!(parse_relfilename("pg_filenode.map"), None);
        assert_eq!(parse_relfilename("PG_VERSION"), None);
        assert_eq!(parse_relfilename("16384_bogus"), None);
        assert_eq!(parse_relfilename(""), None);
    }
}
