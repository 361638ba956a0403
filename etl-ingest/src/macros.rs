//! Shorthands for building and returning [`crate::error::EtlError`].

/// Builds an [`crate::error::EtlError`] from a kind and a static description.
///
/// `detail = ...` adds owned context and `source: ...` the originating error, in that order:
///
/// ```ignore
/// etl_error!(ErrorKind::BlobNotFound, "Schema snapshot missing", detail = key.clone(), source: err)
/// ```
#[macro_export]
macro_rules! etl_error {
    ($kind:expr, $desc:expr $(, detail = $detail:expr)? $(, source: $source:expr)? $(,)?) => {{
        let error = $crate::error::EtlError::from(($kind, $desc));
        $(let error = error.with_detail($detail);)?
        $(let error = error.with_source($source);)?
        error
    }};
}

/// Returns early with an [`crate::error::EtlError`] built by [`etl_error!`].
#[macro_export]
macro_rules! bail {
    ($($args:tt)+) => {
        return ::core::result::Result::Err($crate::etl_error!($($args)+))
    };
}
