//! What a single pipeline run needs to know, and the request shapes we can
//! build it from.

use schemars::JsonSchema;

use super::recognize::OutputFormat;
use crate::{prelude::*, storage::join_key};

/// Object keys below this prefix are standalone requests.
const STANDALONE_REQUESTS_PREFIX: &str = "standalone/requests/";

/// Parameters for one pipeline run, independent of where the request came
/// from. Each run owns its job outright.
#[derive(Clone, Debug, PartialEq)]
pub struct RecognitionJob {
    /// Bucket holding the source image, when the request names one.
    pub source_bucket: Option<String>,

    /// Key of the source image in the source store.
    pub source_key: String,

    /// Prefix in the result store that receives our artifacts.
    pub results_prefix: String,

    /// `+`-joined language codes. Empty means the configured default.
    pub languages: String,

    /// Resize percentage applied to both axes.
    pub scale: u32,

    /// Formats to produce in addition to plain text.
    pub additional_formats: Vec<OutputFormat>,
}

/// A request from a digitization workflow, for one master file image.
#[derive(Clone, Debug, Default, Deserialize, JsonSchema, Serialize)]
pub struct WorkflowRequest {
    /// Language to use for OCR.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lang: String,

    /// Converted image scale factor, as a percentage.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub scale: String,

    /// Bucket holding the source image.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,

    /// Key of the source image.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,

    /// The pid of the metadata parent, if applicable.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub parentpid: String,

    /// The pid of this master file image.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub pid: String,
}

/// The reply to a workflow request.
#[derive(Clone, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
pub struct WorkflowResponse {
    /// The recognized text.
    pub text: String,
}

/// One record of an object-created notification.
#[derive(Clone, Debug, Deserialize)]
pub struct ObjectEventRecord {
    pub s3: ObjectEventEntity,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObjectEventEntity {
    pub bucket: ObjectEventBucket,
    pub object: ObjectEventObject,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObjectEventBucket {
    pub name: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ObjectEventObject {
    pub key: String,
}

/// Anything we can be asked to recognize directly: either a workflow request
/// or a notification that an image was dropped into the standalone area.
#[derive(Clone, Debug, Deserialize)]
pub struct InvocationRequest {
    #[serde(flatten)]
    pub workflow: WorkflowRequest,

    #[serde(default, rename = "Records")]
    pub records: Vec<ObjectEventRecord>,
}

/// Parse a scale percentage, falling back to `default` when empty.
pub fn parse_scale(scale: &str, default: u32) -> Result<u32> {
    if scale.is_empty() {
        return Ok(default);
    }
    let value = scale
        .parse::<u32>()
        .with_context(|| format!("invalid scale: {:?}", scale))?;
    if !(1..=1000).contains(&value) {
        bail!("scale must be between 1 and 1000: {}", value);
    }
    Ok(value)
}

impl RecognitionJob {
    /// Build a job for one page of a service request, writing below
    /// `results_prefix`.
    pub fn for_page(
        results_prefix: String,
        source_key: &str,
        languages: &str,
        scale: u32,
    ) -> Self {
        Self {
            source_bucket: None,
            source_key: source_key.to_owned(),
            results_prefix,
            languages: languages.to_owned(),
            scale,
            additional_formats: vec![OutputFormat::Hocr],
        }
    }

    /// Build a job from a workflow request.
    pub fn from_workflow(req: &WorkflowRequest, default_scale: u32) -> Result<Self> {
        info!("handling workflow ocr request");
        if req.key.is_empty() {
            bail!("workflow request has no source key");
        }
        let scale = parse_scale(&req.scale, default_scale)?;
        let scale_segment = scale.to_string();
        let results_prefix = if req.parentpid.is_empty() || req.pid == req.parentpid {
            join_key(["results", req.pid.as_str(), scale_segment.as_str()])
        } else {
            join_key([
                "results",
                req.parentpid.as_str(),
                req.pid.as_str(),
                scale_segment.as_str(),
            ])
        };
        Ok(Self {
            source_bucket: (!req.bucket.is_empty()).then(|| req.bucket.clone()),
            source_key: req.key.clone(),
            results_prefix,
            languages: req.lang.clone(),
            scale,
            additional_formats: vec![OutputFormat::Hocr],
        })
    }

    /// Build a job from an image dropped into the standalone area.
    pub fn from_standalone(record: &ObjectEventRecord) -> Self {
        info!("handling standalone ocr request");
        let key = &record.s3.object.key;
        let stripped = key.replace(STANDALONE_REQUESTS_PREFIX, "");
        let results_prefix = join_key(["standalone", "results", stripped.as_str()]);
        debug!("key: [{}] => [{}]", key, results_prefix);
        Self {
            source_bucket: Some(record.s3.bucket.name.clone()),
            source_key: key.clone(),
            results_prefix,
            languages: String::new(),
            scale: 100,
            additional_formats: vec![OutputFormat::Hocr, OutputFormat::Pdf],
        }
    }

    /// Pick the right adapter for an invocation.
    pub fn from_invocation(req: &InvocationRequest, default_scale: u32) -> Result<Self> {
        if !req.workflow.pid.is_empty() {
            Self::from_workflow(&req.workflow, default_scale)
        } else if let Some(record) = req.records.first() {
            Ok(Self::from_standalone(record))
        } else {
            Err(anyhow!("unhandled request type"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(json: &str) -> InvocationRequest {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn workflow_results_nest_under_parent() -> Result<()> {
        let req = invocation(
            r#"{"lang":"fra","scale":"50","bucket":"images","key":"a/b.tif","parentpid":"p:1","pid":"p:2"}"#,
        );
        let job = RecognitionJob::from_invocation(&req, 100)?;
        assert_eq!(job.results_prefix, "results/p:1/p:2/50");
        assert_eq!(job.source_bucket.as_deref(), Some("images"));
        assert_eq!(job.source_key, "a/b.tif");
        assert_eq!(job.languages, "fra");
        assert_eq!(job.scale, 50);
        assert_eq!(job.additional_formats, vec![OutputFormat::Hocr]);
        Ok(())
    }

    #[test]
    fn workflow_results_for_top_level_pid() -> Result<()> {
        let req = invocation(r#"{"key":"a.tif","parentpid":"p:1","pid":"p:1"}"#);
        let job = RecognitionJob::from_invocation(&req, 100)?;
        assert_eq!(job.results_prefix, "results/p:1/100");
        assert_eq!(job.source_bucket, None);
        Ok(())
    }

    #[test]
    fn standalone_results_mirror_request_key() -> Result<()> {
        let req = invocation(
            r#"{"Records":[{"s3":{"bucket":{"name":"drop"},"object":{"key":"standalone/requests/user/scan.jpg"}}}]}"#,
        );
        let job = RecognitionJob::from_invocation(&req, 50)?;
        assert_eq!(job.results_prefix, "standalone/results/user/scan.jpg");
        assert_eq!(job.source_bucket.as_deref(), Some("drop"));
        assert_eq!(job.languages, "");
        assert_eq!(job.scale, 100);
        assert_eq!(
            job.additional_formats,
            vec![OutputFormat::Hocr, OutputFormat::Pdf]
        );
        Ok(())
    }

    #[test]
    fn other_requests_are_rejected() {
        let err = RecognitionJob::from_invocation(&invocation("{}"), 100).unwrap_err();
        assert_eq!(err.to_string(), "unhandled request type");
    }

    #[test]
    fn scales_are_validated() {
        assert_eq!(parse_scale("", 100).unwrap(), 100);
        assert_eq!(parse_scale("250", 100).unwrap(), 250);
        assert!(parse_scale("0", 100).is_err());
        assert!(parse_scale("1001", 100).is_err());
        assert!(parse_scale("fifty", 100).is_err());
    }

    #[test]
    fn page_jobs_write_below_their_prefix() {
        let job = RecognitionJob::for_page(
            "doc:1/3/pages/r1/page:9".to_owned(),
            "images/9.tif",
            "",
            100,
        );
        assert_eq!(job.results_prefix, "doc:1/3/pages/r1/page:9");
        assert_eq!(job.source_key, "images/9.tif");
        assert_eq!(job.additional_formats, vec![OutputFormat::Hocr]);
    }
}
