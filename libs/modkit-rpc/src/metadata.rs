//! Metadata keys carried on every call and the application-error side channel.

use std::borrow::Cow;

use tonic::metadata::{MetadataMap, MetadataValue};

use crate::error::ApplicationError;

pub const APP_ID: &str = "app_id";
pub const USER_ID: &str = "user_id";
pub const REQUEST_ID: &str = "rq_id";
pub const REQUEST_KIND: &str = "rq_type";
pub const REQUEST_FROM: &str = "rq_from";
pub const REQUEST_TO: &str = "rq_to";

pub const ERR_CODE: &str = "err_code";
pub const ERR_MESSAGE: &str = "err_message";
pub const ERR_STATUS: &str = "err_status";

/// Request kind stamped on every outgoing call.
pub const REQUEST_KIND_RPC: &str = "rpc";

pub const DEFAULT_ERR_CODE: &str = "1";
pub const DEFAULT_ERR_STATUS: &str = "500";

/// Identity and routing header of a call.
///
/// `from` and `to` are module names; `to` selects the target module on the
/// client side.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CallHeader {
    pub request_id: String,
    pub from: String,
    pub to: String,
    pub app_id: String,
    pub user_id: String,
    pub request_kind: String,
}

impl CallHeader {
    #[must_use]
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            request_kind: REQUEST_KIND_RPC.to_owned(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    #[must_use]
    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }

    #[must_use]
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }

    #[must_use]
    pub fn is_rpc(&self) -> bool {
        self.request_kind == REQUEST_KIND_RPC
    }

    /// Write all six header fields into `metadata`, replacing existing values.
    pub fn write_to(&self, metadata: &mut MetadataMap) {
        insert_value(metadata, APP_ID, &self.app_id);
        insert_value(metadata, USER_ID, &self.user_id);
        insert_value(metadata, REQUEST_ID, &self.request_id);
        insert_value(metadata, REQUEST_KIND, &self.request_kind);
        insert_value(metadata, REQUEST_FROM, &self.from);
        insert_value(metadata, REQUEST_TO, &self.to);
    }

    /// Read the header from incoming metadata. Missing keys become empty strings.
    #[must_use]
    pub fn from_metadata(metadata: &MetadataMap) -> Self {
        Self {
            request_id: first_value(metadata, REQUEST_ID),
            from: first_value(metadata, REQUEST_FROM),
            to: first_value(metadata, REQUEST_TO),
            app_id: first_value(metadata, APP_ID),
            user_id: first_value(metadata, USER_ID),
            request_kind: first_value(metadata, REQUEST_KIND),
        }
    }
}

/// Encode an application error into the `err_*` keys.
pub fn encode_application_error(metadata: &mut MetadataMap, error: &ApplicationError) {
    insert_value(metadata, ERR_CODE, error.code());
    insert_value(metadata, ERR_MESSAGE, error.message());
    insert_value(metadata, ERR_STATUS, error.status());
}

/// Decode an application error from the `err_*` keys.
///
/// Returns `None` unless `err_message` is present and non-empty. Absent code
/// and status fall back to `"1"` and `"500"`; present values are kept even
/// when empty.
#[must_use]
pub fn decode_application_error(metadata: &MetadataMap) -> Option<ApplicationError> {
    let message = first_value(metadata, ERR_MESSAGE);
    if message.is_empty() {
        return None;
    }
    let code = value_or(metadata, ERR_CODE, DEFAULT_ERR_CODE);
    let status = value_or(metadata, ERR_STATUS, DEFAULT_ERR_STATUS);
    Some(ApplicationError::new(code, message, status))
}

/// Replace every byte a metadata value cannot carry with `?`.
#[must_use]
pub fn sanitize_value(value: &str) -> Cow<'_, str> {
    if value.chars().all(is_value_char) {
        return Cow::Borrowed(value);
    }
    Cow::Owned(
        value
            .chars()
            .map(|c| if is_value_char(c) { c } else { '?' })
            .collect(),
    )
}

fn is_value_char(c: char) -> bool {
    c == '\t' || (' '..='~').contains(&c)
}

fn value_or(metadata: &MetadataMap, key: &str, fallback: &str) -> String {
    if metadata.contains_key(key) {
        first_value(metadata, key)
    } else {
        fallback.to_owned()
    }
}

fn first_value(metadata: &MetadataMap, key: &str) -> String {
    metadata
        .get(key)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .unwrap_or_default()
}

fn insert_value(metadata: &mut MetadataMap, key: &'static str, value: &str) {
    match MetadataValue::try_from(sanitize_value(value).as_ref()) {
        Ok(value) => {
            metadata.insert(key, value);
        }
        Err(e) => tracing::warn!(key, error = %e, "dropping unencodable metadata value"),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn header_survives_metadata_hop() {
        let header = CallHeader::new("gateway", "auth")
            .with_request_id("r-1")
            .with_app_id("A1")
            .with_user_id("u-9");

        let mut md = MetadataMap::new();
        header.write_to(&mut md);

        let parsed = CallHeader::from_metadata(&md);
        assert_eq!(parsed, header);
        assert!(parsed.is_rpc());
    }

    #[test]
    fn missing_keys_read_as_empty() {
        let parsed = CallHeader::from_metadata(&MetadataMap::new());
        assert_eq!(parsed, CallHeader::default());
        assert!(!parsed.is_rpc());
    }

    #[test]
    fn non_ascii_values_are_replaced() {
        assert_eq!(sanitize_value("plain"), "plain");
        assert_eq!(sanitize_value("zoë\n"), "zo??");

        let mut md = MetadataMap::new();
        let header = CallHeader::new("gateway", "auth").with_user_id("jürgen");
        header.write_to(&mut md);
        assert_eq!(CallHeader::from_metadata(&md).user_id, "j?rgen");
    }

    #[test]
    fn error_side_channel_requires_message() {
        let mut md = MetadataMap::new();
        assert!(decode_application_error(&md).is_none());

        md.insert(ERR_CODE, MetadataValue::from_static("42"));
        assert!(
            decode_application_error(&md).is_none(),
            "a code without a message is not an error"
        );

        md.insert(ERR_MESSAGE, MetadataValue::from_static("denied"));
        let err = decode_application_error(&md).expect("decoded");
        assert_eq!(err.code(), "42");
        assert_eq!(err.status(), "500");
        assert_eq!(err.message(), "denied");
    }

    #[test]
    fn empty_code_and_status_are_kept() {
        let mut md = MetadataMap::new();
        md.insert(ERR_MESSAGE, MetadataValue::from_static("denied"));
        md.insert(ERR_CODE, MetadataValue::from_static(""));
        md.insert(ERR_STATUS, MetadataValue::from_static(""));

        let err = decode_application_error(&md).expect("decoded");
        assert_eq!(err.code(), "");
        assert_eq!(err.status(), "");
    }

    #[test]
    fn encoded_error_decodes_with_its_own_triple() {
        let mut md = MetadataMap::new();
        encode_application_error(&mut md, &ApplicationError::new("42", "denied", "403"));
        let err = decode_application_error(&md).expect("decoded");
        assert_eq!(err, ApplicationError::new("42", "denied", "403"));
    }
}
