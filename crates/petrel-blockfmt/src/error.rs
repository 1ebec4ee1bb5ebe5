use error_stack::Report;

/// Errors produced by the block format and the converter.
///
/// The variants mirror the failure kinds the caller has to distinguish:
/// configuration mistakes, per-input conversion failures (some of which
/// are [fatal](is_fatal)), and upload failures.
#[derive(derive_more::Display, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[display(fmt = "no inputs or merge sources")]
    NoInputs,
    #[display(fmt = "compression \"{_0}\" unavailable")]
    UnknownCompression(String),
    #[display(fmt = "alignment {_0} is not a power of two")]
    BadAlign(usize),
    #[display(fmt = "record does not match the expected row shape")]
    NoMatch,
    #[display(fmt = "record larger than the chunk alignment")]
    TooLarge,
    #[display(fmt = "corrupt {_0} stream")]
    Corrupt(&'static str),
    #[display(fmt = "malformed JSON input")]
    Syntax,
    #[display(fmt = "error reading input")]
    Read,
    #[display(fmt = "prepend")]
    Prepend,
    #[display(fmt = "error writing block data")]
    Write,
    #[display(fmt = "error uploading object")]
    Upload,
    #[display(fmt = "invalid object trailer")]
    BadTrailer,
    #[display(fmt = "cloudtrail format does not accept hints")]
    HintsRejected,
    #[display(fmt = "invalid schema hints")]
    BadHints,
    #[display(fmt = "too many uploaded parts for one writer lane")]
    TooManyParts,
    #[display(fmt = "internal error")]
    Internal,
}

impl error_stack::Context for Error {}

impl Error {
    /// Whether this error kind will not disappear on a retry.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::NoMatch | Error::TooLarge | Error::Corrupt(_))
    }
}

/// Returns true if any frame of `report` carries an error known to be
/// fatal to conversion: a row that can never match, a record that can
/// never fit a chunk, or a structurally corrupt compressed stream.
/// Fatal errors must not be retried by the caller.
pub fn is_fatal(report: &Report<Error>) -> bool {
    report
        .frames()
        .filter_map(|frame| frame.downcast_ref::<Error>())
        .any(Error::is_fatal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use error_stack::{report, ResultExt};

    #[test]
    fn test_is_fatal_sees_through_wrapping() {
        let inner: error_stack::Result<(), Error> = Err(report!(Error::Corrupt("gzip")));
        let wrapped = inner
            .change_context(Error::Read)
            .attach_printable("input logs/day-01.json.gz")
            .unwrap_err();
        assert!(is_fatal(&wrapped));
    }

    #[test]
    fn test_transient_errors_are_not_fatal() {
        let report = report!(Error::Read).attach_printable("connection reset");
        assert!(!is_fatal(&report));
    }
}
