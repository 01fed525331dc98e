/// Numeric error codes carried on refusal frames.
///
/// Codes are grouped by decade so clients can branch on the family
/// (`code / 10`) without knowing every individual value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    Internal = 1,
    Parsing = 2,
    Permission = 3,

    WrongPassword = 10,
    UnknownUser = 11,
    DuplicateUser = 12,

    ChannelNotFound = 20,
    NotMember = 21,
    AlreadyMember = 22,
    DuplicateChannel = 23,

    InsertFailed = 30,
    MessageNotFound = 31,

    EmptyChannel = 40,

    NicknameTooShort = 50,
    NicknameTooLong = 51,
    UserVanished = 52,

    NotOwner = 60,

    KeyUnavailable = 70,
    KeyRefused = 71,
    KeyTimeout = 72,
    InvalidKey = 73,

    FileNotFound = 80,
    InvalidPayload = 81,
}

impl ErrorCode {
    pub fn as_u16(self) -> u16 {
        self as u16
    }
}

impl From<ErrorCode> for u16 {
    fn from(code: ErrorCode) -> Self {
        code.as_u16()
    }
}
