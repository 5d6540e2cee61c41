//! Response classification.
//!
//! CloudStack reuses HTTP status codes as business signals, so every raw
//! response goes through this one state machine:
//!
//! | status | body                 | result                                  |
//! |--------|----------------------|-----------------------------------------|
//! | 200    | any                  | parsed document                         |
//! | ≠ 200  | empty / absent       | API error "No error information..."     |
//! | ≠ 200  | HTML, 401 / 403      | authentication error, message = body    |
//! | ≠ 200  | HTML, 430-432 / 436  | `None` (no matching resource)           |
//! | ≠ 200  | HTML, anything else  | API error, message = body               |
//! | ≠ 200  | otherwise            | API error from `errorcode`/`errortext`  |

use crate::error::{CsError, CsResult, ParsedError};
use crate::transport::RawResponse;
use crate::wire::WireObserver;
use crate::xml::{parse_response, XmlDocument};

/// Statuses that mean "no resource of this type matches".
pub const NOT_FOUND_CODES: [u16; 4] = [430, 431, 432, 436];

/// Classify a raw response. `Ok(None)` is the not-found signal.
pub fn classify(
    response: &RawResponse,
    wire: Option<&dyn WireObserver>,
) -> CsResult<Option<XmlDocument>> {
    classify_parts(response.status, response.body.as_deref(), wire)
}

pub fn classify_parts(
    status: u16,
    body: Option<&str>,
    wire: Option<&dyn WireObserver>,
) -> CsResult<Option<XmlDocument>> {
    if status == 200 {
        return parse_response(status, body.unwrap_or_default(), wire).map(Some);
    }
    let body = match body {
        Some(b) if !b.is_empty() => b,
        _ => {
            return Err(CsError::api(
                i32::from(status),
                "No error information was provided",
            ))
        }
    };
    if looks_like_html(body) {
        return match status {
            401 | 403 => Err(CsError::authentication(i32::from(status), body)),
            s if NOT_FOUND_CODES.contains(&s) => {
                log::debug!("classify(): HTTP {} treated as no matching resource", s);
                Ok(None)
            }
            _ => Err(CsError::api(i32::from(status), body)),
        };
    }
    Err(parse_error(status, body, wire).into_error())
}

/// Extract code and message from a non-HTML error body.
///
/// The code starts as the HTTP status and is replaced by the last
/// `errorcode` element; the message comes from the last `errortext`
/// element. A body that cannot be read (not XML, or a non-numeric
/// `errorcode`) becomes the message itself. The status table supplies the
/// message when nothing else does.
pub fn parse_error(status: u16, body: &str, wire: Option<&dyn WireObserver>) -> ParsedError {
    let defaults = ParsedError::from_status(status);
    let mut code = defaults.code;
    let mut message: Option<String> = None;

    match parse_response(status, body, wire) {
        Ok(doc) => {
            let mut readable = true;
            for element in doc.elements_by_tag_name("errorcode") {
                if let Some(text) = element.text() {
                    match text.trim().parse::<i32>() {
                        Ok(c) => code = c,
                        Err(e) => {
                            log::warn!("parse_error(): Error was unparsable: {}", e);
                            readable = false;
                            break;
                        }
                    }
                }
            }
            if readable {
                for element in doc.elements_by_tag_name("errortext") {
                    if let Some(text) = element.text() {
                        message = Some(text.to_string());
                    }
                }
            } else {
                message = Some(body.to_string());
            }
        }
        Err(e) => {
            log::warn!("parse_error(): Error was unparsable: {}", e);
            message = Some(body.to_string());
        }
    }

    ParsedError {
        code,
        message: message.unwrap_or(defaults.message),
    }
}

fn looks_like_html(body: &str) -> bool {
    body.to_ascii_lowercase().contains("<html")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CsErrorKind;

    const HTML: &str = "<html><head><title>Apache Tomcat - Error report</title></head><body>denied</body></html>";

    #[test]
    fn ok_returns_document() {
        let body = "<listzonesresponse><count>1</count><zone><id>z1</id></zone></listzonesresponse>";
        let doc = classify_parts(200, Some(body), None).unwrap().unwrap();
        assert_eq!(doc, XmlDocument::parse(body).unwrap());
    }

    #[test]
    fn ok_with_garbage_is_communication_error() {
        let err = classify_parts(200, Some("oops"), None).unwrap_err();
        assert_eq!(err.kind, CsErrorKind::Communication);
        assert!(err.message.contains("[200]: oops"));
    }

    #[test]
    fn empty_body() {
        for body in [None, Some("")] {
            let err = classify_parts(500, body, None).unwrap_err();
            assert_eq!(err.kind, CsErrorKind::Api);
            assert_eq!(err.code, Some(500));
            assert_eq!(err.message, "No error information was provided");
        }
    }

    #[test]
    fn html_not_found_codes_are_sentinel() {
        for status in NOT_FOUND_CODES {
            assert!(classify_parts(status, Some(HTML), None).unwrap().is_none());
        }
    }

    #[test]
    fn html_auth_codes() {
        for status in [401u16, 403] {
            let err = classify_parts(status, Some(HTML), None).unwrap_err();
            assert!(err.is_authentication());
            assert_eq!(err.code, Some(i32::from(status)));
            assert_eq!(err.message, HTML);
        }
    }

    #[test]
    fn html_other_codes_are_general() {
        let err = classify_parts(530, Some(HTML), None).unwrap_err();
        assert_eq!(err.kind, CsErrorKind::Api);
        assert_eq!(err.code, Some(530));
        assert_eq!(err.message, HTML);
    }

    #[test]
    fn xml_not_found_code_is_an_error() {
        let body = "<listtemplatesresponse><errorcode>431</errorcode><errortext>Unable to execute API command listtemplates due to invalid value</errortext></listtemplatesresponse>";
        let err = classify_parts(431, Some(body), None).unwrap_err();
        assert!(err.has_code(431));
        assert!(err.message.starts_with("Unable to execute API command"));
    }

    #[test]
    fn errorcode_overrides_status() {
        let body = "<r><errorcode>530</errorcode><errortext>Internal error executing command</errortext></r>";
        let parsed = parse_error(432, body, None);
        assert_eq!(parsed.code, 530);
        assert_eq!(parsed.message, "Internal error executing command");
    }

    #[test]
    fn missing_errortext_uses_status_table() {
        let parsed = parse_error(531, "<r><errorcode>531</errorcode></r>", None);
        assert_eq!(parsed.message, "Unable to find account");
        let parsed = parse_error(401, "<r/>", None);
        assert_eq!(parsed, ParsedError { code: 401, message: "Unauthorized user".into() });
    }

    #[test]
    fn unparsable_body_becomes_message() {
        let parsed = parse_error(530, "Service Unavailable", None);
        assert_eq!(parsed.code, 530);
        assert_eq!(parsed.message, "Service Unavailable");
    }

    #[test]
    fn non_numeric_errorcode() {
        let body = "<r><errorcode>abc</errorcode><errortext>ignored</errortext></r>";
        let parsed = parse_error(500, body, None);
        assert_eq!(parsed.code, 500);
        assert_eq!(parsed.message, body);
    }

    #[test]
    fn raw_response_entry_point() {
        let response = RawResponse::new(436, Some(HTML));
        assert!(classify(&response, None).unwrap().is_none());
    }
}
