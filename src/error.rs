use quick_error::quick_error;

quick_error! {
    /// Runtime error taxonomy. Every variant has a stable signed wire code
    /// (see [`Error::code`]) so a failure produced on one node can be
    /// reported verbatim by a completion callback on another.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Error {
        Inval { display("invalid argument") }
        Uninit { display("runtime not initialized") }
        Already { display("already initialized or registered") }
        NoPerm { display("operation not permitted") }
        NoMem { display("out of memory") }
        NoSpace { display("no space or quota exceeded") }
        Exist { display("already exists") }
        Nonexist { display("no such entry") }
        Unreg { display("opcode not registered") }
        Hg { display("transport failure") }
        Proto { display("protocol mismatch") }
        Trunc { display("scatter-gather list too small") }
        TimedOut { display("timed out") }
        Canceled { display("canceled") }
        Misc { display("unspecified failure") }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Signed return code carried on the wire: 0 is success, failures are
    /// negative. `code()` of any variant round-trips through `from_code`.
    pub fn code(&self) -> i32 {
        use Error::*;

        let positive = match self {
            Inval => 1,
            Uninit => 2,
            Already => 3,
            NoPerm => 4,
            NoMem => 5,
            NoSpace => 6,
            Exist => 7,
            Nonexist => 8,
            Unreg => 9,
            Hg => 10,
            Proto => 11,
            Trunc => 12,
            TimedOut => 13,
            Canceled => 14,
            Misc => 15,
        };

        -positive
    }

    pub fn from_code(code: i32) -> Option<Error> {
        use Error::*;

        let error = match -code {
            1 => Inval,
            2 => Uninit,
            3 => Already,
            4 => NoPerm,
            5 => NoMem,
            6 => NoSpace,
            7 => Exist,
            8 => Nonexist,
            9 => Unreg,
            10 => Hg,
            11 => Proto,
            12 => Trunc,
            13 => TimedOut,
            14 => Canceled,
            15 => Misc,
            _ => return None,
        };

        Some(error)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Error {
        use nix::errno::Errno;

        let errno = match err.raw_os_error() {
            Some(raw) => Errno::from_i32(raw),
            None => return Error::Misc,
        };

        match errno {
            Errno::EPERM | Errno::EACCES => Error::NoPerm,
            Errno::ENOMEM => Error::NoMem,
            Errno::EDQUOT | Errno::ENOSPC => Error::NoSpace,
            Errno::EEXIST => Error::Exist,
            Errno::ENOENT => Error::Nonexist,
            Errno::ECANCELED => Error::Canceled,
            _ => Error::Misc,
        }
    }
}

/// Completion code of a result: 0 on success, the error's wire code
/// otherwise.
pub fn rc_of(result: &Result<()>) -> i32 {
    match result {
        Ok(()) => 0,
        Err(err) => err.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        let all = [
            Error::Inval,
            Error::Uninit,
            Error::Already,
            Error::NoPerm,
            Error::NoMem,
            Error::NoSpace,
            Error::Exist,
            Error::Nonexist,
            Error::Unreg,
            Error::Hg,
            Error::Proto,
            Error::Trunc,
            Error::TimedOut,
            Error::Canceled,
            Error::Misc,
        ];

        for error in all {
            assert!(error.code() < 0);
            assert_eq!(Error::from_code(error.code()), Some(error));
        }

        assert_eq!(Error::from_code(0), None);
        assert_eq!(Error::from_code(-1000), None);
    }

    #[test]
    fn errno_translation() {
        let not_found = std::io::Error::from_raw_os_error(nix::errno::Errno::ENOENT as i32);
        assert_eq!(Error::from(not_found), Error::Nonexist);

        let no_perm = std::io::Error::from_raw_os_error(nix::errno::Errno::EACCES as i32);
        assert_eq!(Error::from(no_perm), Error::NoPerm);
    }
}
