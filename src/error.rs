use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    Format(&'static str),
    MissingField(&'static str),
    BadFieldLength(&'static str),
    UnexpectedOp(u8),
    UnsupportedVersion(u32),
    Compression(&'static str),
    BadState(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::Format(msg) => write!(f, "malformed record: {msg}"),
            Error::MissingField(name) => write!(f, "required field '{name}' missing"),
            Error::BadFieldLength(name) => write!(f, "field '{name}' has wrong size"),
            Error::UnexpectedOp(op) => write!(f, "unexpected record op {op:#04x}"),
            Error::UnsupportedVersion(version) => {
                write!(f, "unsupported bag version: {}.{}", version / 100, version % 100)
            }
            Error::Compression(msg) => write!(f, "compression error: {msg}"),
            Error::BadState(msg) => write!(f, "bad state: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
