//! Turning a request into a job key, and checking whether that job exists.

use crate::{
    jobs::manifest::job_record_key,
    pipeline::{job::parse_scale, languages::validate_language_string},
    prelude::*,
    storage::ObjectStore,
};

/// A caller's request for OCR. Everything except `pid` comes from the query
/// string, where empty values mean "not given".
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct OcrRequest {
    /// The document identifier.
    #[serde(default)]
    pub pid: String,

    /// A unit within the document.
    #[serde(default)]
    pub unit: Option<String>,

    /// An explicit page list, passed through to the metadata service.
    #[serde(default)]
    pub pages: Option<String>,

    /// Opaque caller token, required with `pages`.
    #[serde(default)]
    pub token: Option<String>,

    /// Where to send a completion notification.
    #[serde(default)]
    pub email: Option<String>,

    /// Language override.
    #[serde(default)]
    pub lang: Option<String>,

    /// Scale override, as a percentage.
    #[serde(default)]
    pub scale: Option<String>,
}

/// A field, treating empty strings as absent.
fn given(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|value| !value.is_empty())
}

impl OcrRequest {
    /// The notification address, if any.
    pub fn email(&self) -> Option<&str> {
        given(&self.email)
    }

    /// The explicit page list, if any.
    pub fn pages(&self) -> Option<&str> {
        given(&self.pages)
    }

    /// The language override, or empty if none was given.
    pub fn lang(&self) -> &str {
        given(&self.lang).unwrap_or_default()
    }

    /// Query parameters which identify this job, for building status URLs.
    pub fn identity_query(&self) -> String {
        let mut params = vec![];
        for (name, value) in [
            ("unit", &self.unit),
            ("pages", &self.pages),
            ("token", &self.token),
        ] {
            if let Some(value) = given(value) {
                params.push(format!("{}={}", name, urlencoding::encode(value)));
            }
        }
        if params.is_empty() {
            String::new()
        } else {
            format!("?{}", params.join("&"))
        }
    }
}

/// Why a request could not be turned into a job.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum IdentityError {
    #[error("Missing token")]
    MissingToken,

    #[error("invalid {field}: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("invalid unit: {0:?}")]
    InvalidUnit(String),

    #[error("invalid {field}: {reason}")]
    InvalidOption { field: &'static str, reason: String },
}

/// The resolved identity of a job.
#[derive(Clone, Debug, PartialEq)]
pub struct JobIdentity {
    /// The key below which everything about this job is stored.
    pub key: String,

    /// The document identifier.
    pub pid: String,

    /// The unit, when one was requested.
    pub unit: Option<u32>,

    /// The explicit page list, when one was requested.
    pub pages: Option<String>,
}

/// Check that an identifier is safe to use as a key segment.
fn check_identifier(field: &'static str, value: &str) -> Result<(), IdentityError> {
    if value.is_empty() || value.contains(['/', '\\']) || value.contains("..") {
        return Err(IdentityError::InvalidIdentifier {
            field,
            value: value.to_owned(),
        });
    }
    Ok(())
}

/// Derive the job key from a request.
///
/// An explicit page list is keyed by its token, so partial requests for the
/// same document never collide. Otherwise a unit nests below the document.
/// Fields that don't describe the work, like `email`, never affect the key.
pub fn resolve_identity(req: &OcrRequest) -> Result<JobIdentity, IdentityError> {
    check_identifier("pid", &req.pid)?;

    let unit = match given(&req.unit) {
        None => None,
        Some(unit) => match unit.parse::<u32>() {
            Ok(0) => None,
            Ok(unit) => Some(unit),
            Err(_) => return Err(IdentityError::InvalidUnit(unit.to_owned())),
        },
    };

    if let Some(pages) = req.pages() {
        let Some(token) = given(&req.token) else {
            warn!("Request for partial OCR is missing a token");
            return Err(IdentityError::MissingToken);
        };
        check_identifier("token", token)?;
        info!("Request for partial OCR including pages: {}", pages);
        return Ok(JobIdentity {
            key: token.to_owned(),
            pid: req.pid.clone(),
            unit,
            pages: Some(pages.to_owned()),
        });
    }

    let key = match unit {
        Some(unit) => format!("{}/{}", req.pid, unit),
        None => req.pid.clone(),
    };
    Ok(JobIdentity {
        key,
        pid: req.pid.clone(),
        unit,
        pages: None,
    })
}

/// Validate the language and scale overrides, returning the scale.
pub fn resolve_options(req: &OcrRequest, default_scale: u32) -> Result<u32, IdentityError> {
    validate_language_string(req.lang()).map_err(|err| IdentityError::InvalidOption {
        field: "lang",
        reason: err.to_string(),
    })?;
    parse_scale(given(&req.scale).unwrap_or_default(), default_scale).map_err(|err| {
        IdentityError::InvalidOption {
            field: "scale",
            reason: format!("{:#}", err),
        }
    })
}

/// Has a job already been started for `key`?
pub async fn check_existing(store: &dyn ObjectStore, key: &str) -> Result<bool> {
    store
        .exists(&job_record_key(key))
        .await
        .with_context(|| format!("failed to check for existing job {}", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::fs::FsStore;

    fn request(pid: &str) -> OcrRequest {
        OcrRequest {
            pid: pid.to_owned(),
            ..OcrRequest::default()
        }
    }

    #[test]
    fn whole_documents_are_keyed_by_pid() {
        let id = resolve_identity(&request("uva-lib:1234")).unwrap();
        assert_eq!(id.key, "uva-lib:1234");
        assert_eq!(id.unit, None);
    }

    #[test]
    fn units_nest_below_the_pid() {
        let mut req = request("uva-lib:1234");
        req.unit = Some("42".to_owned());
        assert_eq!(resolve_identity(&req).unwrap().key, "uva-lib:1234/42");

        req.unit = Some("0".to_owned());
        assert_eq!(resolve_identity(&req).unwrap().key, "uva-lib:1234");

        req.unit = Some("".to_owned());
        assert_eq!(resolve_identity(&req).unwrap().key, "uva-lib:1234");

        req.unit = Some("forty".to_owned());
        assert_eq!(
            resolve_identity(&req).unwrap_err(),
            IdentityError::InvalidUnit("forty".to_owned())
        );
    }

    #[test]
    fn page_lists_are_keyed_by_token() {
        let mut req = request("uva-lib:1234");
        req.unit = Some("42".to_owned());
        req.pages = Some("p:1,p:2".to_owned());
        assert_eq!(
            resolve_identity(&req).unwrap_err(),
            IdentityError::MissingToken
        );

        req.token = Some("".to_owned());
        assert_eq!(
            resolve_identity(&req).unwrap_err(),
            IdentityError::MissingToken
        );

        req.token = Some("abc123".to_owned());
        let id = resolve_identity(&req).unwrap();
        assert_eq!(id.key, "abc123");
        assert_eq!(id.pages.as_deref(), Some("p:1,p:2"));
    }

    #[test]
    fn irrelevant_fields_do_not_change_the_key() {
        let mut a = request("uva-lib:1234");
        a.unit = Some("7".to_owned());
        let mut b = a.clone();
        b.email = Some("someone@example.com".to_owned());
        b.lang = Some("fra".to_owned());
        assert_eq!(resolve_identity(&a), resolve_identity(&b));
    }

    #[test]
    fn unsafe_identifiers_are_rejected() {
        for pid in ["", "a/b", "..", "a\\b"] {
            assert!(matches!(
                resolve_identity(&request(pid)),
                Err(IdentityError::InvalidIdentifier { field: "pid", .. })
            ));
        }
        let mut req = request("doc");
        req.pages = Some("1".to_owned());
        req.token = Some("../x".to_owned());
        assert!(matches!(
            resolve_identity(&req),
            Err(IdentityError::InvalidIdentifier { field: "token", .. })
        ));
    }

    #[test]
    fn options_are_validated() {
        let mut req = request("doc");
        assert_eq!(resolve_options(&req, 100), Ok(100));
        req.scale = Some("50".to_owned());
        assert_eq!(resolve_options(&req, 100), Ok(50));
        req.scale = Some("5000".to_owned());
        assert!(resolve_options(&req, 100).is_err());
        req.scale = None;
        req.lang = Some("eng+../../x".to_owned());
        assert!(resolve_options(&req, 100).is_err());
    }

    #[test]
    fn identity_query_round_trips_identifying_fields() {
        let mut req = request("doc");
        assert_eq!(req.identity_query(), "");
        req.pages = Some("p:1,p:2".to_owned());
        req.token = Some("t".to_owned());
        req.email = Some("x@example.com".to_owned());
        assert_eq!(req.identity_query(), "?pages=p%3A1%2Cp%3A2&token=t");
    }

    #[tokio::test]
    async fn existing_jobs_are_found_by_record() -> Result<()> {
        let tmpdir = tempfile::TempDir::with_prefix("identity")?;
        let store = FsStore::new(tmpdir.path().to_owned());
        assert!(!check_existing(&store, "doc").await?);
        store.put_bytes("doc/42/job.json", b"{}".to_vec()).await?;
        assert!(!check_existing(&store, "doc").await?);
        assert!(check_existing(&store, "doc/42").await?);
        Ok(())
    }
}
