use std::{
    error::Error,
    fmt::{Debug, Display},
    sync::Arc,
};

struct ResidualErrorData {
    message: String,
    debug: String,
}

/// A cloneable snapshot of an error.
///
/// A batch failure has one original error but many waiting callers. The first
/// sink receives the original; the rest receive `ResidualError` clones, which
/// keep the message and debug rendering but drop the source chain.
#[derive(Clone)]
pub struct ResidualError(Arc<ResidualErrorData>);

impl ResidualError {
    pub fn new<E: Display + Debug>(err: &E) -> Self {
        Self(Arc::new(ResidualErrorData {
            message: err.to_string(),
            debug: format!("{err:?}"),
        }))
    }
}

impl Display for ResidualError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.message)
    }
}

impl Debug for ResidualError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.debug)
    }
}

impl Error for ResidualError {}
