use std::{error, fmt};

pub type Result<T> = std::result::Result<T, Error>;

type Source = Box<dyn error::Error + Send + Sync + 'static>;

pub struct Error {
    kind: ErrorKind,
    source: Option<Source>,
}

#[derive(Debug, Eq, PartialEq)]
pub(crate) enum ErrorKind {
    Closed,

    Unmarshal,
    EmptyAttributeKey,
    NodeNotInView,
    NodeAlreadyInRing,
    NodeNotInRing,
    OversizedItem,
}

impl Error {
    pub(crate) fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub(crate) fn new(kind: ErrorKind, source: Option<Source>) -> Self {
        Self { kind, source }
    }

    pub(crate) fn new_closed() -> Self {
        Self::new(ErrorKind::Closed, None)
    }

    pub(crate) fn new_codec(source: Source) -> Self {
        Self::new(ErrorKind::Unmarshal, Some(source))
    }

    pub(crate) fn new_empty_attribute_key() -> Self {
        Self::new(ErrorKind::EmptyAttributeKey, None)
    }

    pub(crate) fn new_node_not_in_view() -> Self {
        Self::new(ErrorKind::NodeNotInView, None)
    }

    pub(crate) fn new_node_already_in_ring() -> Self {
        Self::new(ErrorKind::NodeAlreadyInRing, None)
    }

    pub(crate) fn new_node_not_in_ring() -> Self {
        Self::new(ErrorKind::NodeNotInRing, None)
    }

    pub(crate) fn new_oversized_item() -> Self {
        Self::new(ErrorKind::OversizedItem, None)
    }
}

impl From<ErrorKind> for Error {
    fn from(t: ErrorKind) -> Self {
        Error::new(t, None)
    }
}

impl From<(ErrorKind, Source)> for Error {
    fn from(t: (ErrorKind, Source)) -> Self {
        Error::new(t.0, Some(t.1))
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut f = f.debug_tuple("Error");
        f.field(&self.kind);
        if let Some(source) = &self.source {
            f.field(source);
        }
        f.finish()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(source) = &self.source {
            write!(f, "{}: {}", self.kind, source)
        } else {
            write!(f, "{}", self.kind)
        }
    }
}

impl error::Error for Error {}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}
