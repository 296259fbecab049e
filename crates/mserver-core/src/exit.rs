//! Worker exit codes (BSD `sysexits.h`) and their descriptions

pub const EX_OK: i32 = 0;
pub const EX_USAGE: i32 = 64;
pub const EX_DATAERR: i32 = 65;
pub const EX_NOINPUT: i32 = 66;
pub const EX_NOUSER: i32 = 67;
pub const EX_NOHOST: i32 = 68;
pub const EX_UNAVAILABLE: i32 = 69;
pub const EX_SOFTWARE: i32 = 70;
pub const EX_OSERR: i32 = 71;
pub const EX_OSFILE: i32 = 72;
pub const EX_CANTCREAT: i32 = 73;
pub const EX_IOERR: i32 = 74;
pub const EX_TEMPFAIL: i32 = 75;
pub const EX_PROTOCOL: i32 = 76;
pub const EX_NOPERM: i32 = 77;
pub const EX_CONFIG: i32 = 78;

/// Translates a worker exit code into text for the reaping log line
pub type ExitTranslator = fn(i32) -> &'static str;

/// Describe a `sysexits` code
pub fn describe_exit(code: i32) -> &'static str {
    match code {
        EX_OK => "normal termination",
        EX_USAGE => "usage error",
        EX_DATAERR => "data format error",
        EX_NOINPUT => "cannot open input",
        EX_NOUSER => "addressee unknown",
        EX_NOHOST => "host name unknown",
        EX_UNAVAILABLE => "service unavailable",
        EX_SOFTWARE => "internal software error",
        EX_OSERR => "system error",
        EX_OSFILE => "critical OS file missing",
        EX_CANTCREAT => "can't create (user) output file",
        EX_IOERR => "input/output error",
        EX_TEMPFAIL => "temporary failure",
        EX_PROTOCOL => "remote error in protocol",
        EX_NOPERM => "permission denied",
        EX_CONFIG => "configuration error",
        _ => "unknown exit code",
    }
}
