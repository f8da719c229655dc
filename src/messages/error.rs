// Structural decoding of backend ErrorResponse fields.

use crate::errors::Error;

/// Fields of an ErrorResponse or NoticeResponse payload.
///
/// The payload is a sequence of `(field type byte, nul-terminated value)`
/// pairs ending with a single zero byte. Only the fields this pooler acts on
/// are kept; everything else is skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgErrorMsg {
    pub severity: String,
    pub code: String,
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl PgErrorMsg {
    /// Parse an ErrorResponse payload (the bytes after tag and length).
    ///
    /// Field order is not assumed: the severity is located by its `'S'` (or
    /// non-localized `'V'`) field type, never by byte offset. Truncated
    /// payloads fail to parse and are treated by callers as non-fatal.
    pub fn parse(payload: &[u8]) -> Result<PgErrorMsg, Error> {
        let mut severity = None;
        let mut code = None;
        let mut message = None;
        let mut detail = None;
        let mut hint = None;

        let mut cursor = 0usize;
        while cursor < payload.len() {
            let field_type = payload[cursor];
            if field_type == 0 {
                break;
            }
            cursor += 1;

            let start = cursor;
            while cursor < payload.len() && payload[cursor] != 0 {
                cursor += 1;
            }
            if cursor == payload.len() {
                return Err(Error::ProtocolSyncError(
                    "truncated ErrorResponse field".into(),
                ));
            }
            let value = String::from_utf8_lossy(&payload[start..cursor]).to_string();
            cursor += 1;

            match field_type {
                // Localized severity; 'V' is the non-localized variant and wins.
                b'S' => {
                    if severity.is_none() {
                        severity = Some(value);
                    }
                }
                b'V' => severity = Some(value),
                b'C' => code = Some(value),
                b'M' => message = Some(value),
                b'D' => detail = Some(value),
                b'H' => hint = Some(value),
                _ => (),
            }
        }

        match severity {
            Some(severity) => Ok(PgErrorMsg {
                severity,
                code: code.unwrap_or_default(),
                message: message.unwrap_or_default(),
                detail,
                hint,
            }),
            None => Err(Error::ProtocolSyncError(
                "ErrorResponse carries no severity field".into(),
            )),
        }
    }

    /// True when the backend will not accept further commands on this
    /// connection.
    pub fn is_fatal(&self) -> bool {
        self.severity == "FATAL" || self.severity == "PANIC"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(fields: &[(u8, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        for (field_type, value) in fields {
            out.push(*field_type);
            out.extend_from_slice(value.as_bytes());
            out.push(0);
        }
        out.push(0);
        out
    }

    #[test]
    fn parses_all_known_fields() {
        let bytes = payload(&[
            (b'S', "ERROR"),
            (b'V', "ERROR"),
            (b'C', "42P01"),
            (b'M', "relation \"users\" does not exist"),
            (b'H', "check the schema"),
        ]);
        let msg = PgErrorMsg::parse(&bytes).unwrap();
        assert_eq!(msg.severity, "ERROR");
        assert_eq!(msg.code, "42P01");
        assert_eq!(msg.message, "relation \"users\" does not exist");
        assert_eq!(msg.hint.as_deref(), Some("check the schema"));
        assert!(!msg.is_fatal());
    }

    #[test]
    fn fatal_and_panic_severities() {
        for severity in ["FATAL", "PANIC"] {
            let bytes = payload(&[(b'S', severity), (b'C', "57P01"), (b'M', "going down")]);
            assert!(PgErrorMsg::parse(&bytes).unwrap().is_fatal());
        }
        let bytes = payload(&[(b'S', "WARNING"), (b'M', "just so you know")]);
        assert!(!PgErrorMsg::parse(&bytes).unwrap().is_fatal());
    }

    #[test]
    fn severity_found_regardless_of_field_order() {
        let bytes = payload(&[(b'M', "server shutting down"), (b'C', "57P01"), (b'S', "FATAL")]);
        let msg = PgErrorMsg::parse(&bytes).unwrap();
        assert!(msg.is_fatal());
    }

    #[test]
    fn non_localized_severity_wins() {
        let bytes = payload(&[(b'S', "FATALE"), (b'V', "FATAL"), (b'M', "localized")]);
        let msg = PgErrorMsg::parse(&bytes).unwrap();
        assert_eq!(msg.severity, "FATAL");
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut bytes = payload(&[(b'S', "FATAL"), (b'M', "cut off")]);
        bytes.truncate(3);
        assert!(PgErrorMsg::parse(&bytes).is_err());
    }

    #[test]
    fn missing_severity_is_an_error() {
        let bytes = payload(&[(b'M', "no severity here")]);
        assert!(PgErrorMsg::parse(&bytes).is_err());
    }
}
