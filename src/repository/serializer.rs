use serde_json::Value;

use crate::error::{MillError, Result};
use crate::model::{
    ComponentSpec, Document, Job, JobId, LoadError, LoadResult, PluginRegistry, SchemaVersion,
};

/// Schema version written into every job record.
pub const JOB_SCHEMA_VERSION: SchemaVersion = SchemaVersion::new(1, 0);
pub const JOB_TYPE: &str = "Job";
pub const JOB_CATEGORY: &str = "jobs";

/// Serialize a job into its self-describing persisted document.
pub fn to_document(job: &Job) -> Result<Document> {
    let value = serde_json::to_value(job)?;
    let Value::Object(attrs) = value else {
        return Err(MillError::Internal(
            "job did not serialize to an object".into(),
        ));
    };
    let mut doc = Document::new(JOB_TYPE, JOB_SCHEMA_VERSION, JOB_CATEGORY);
    doc.attrs = attrs;
    Ok(doc)
}

/// Reconstruct a job from a document, tolerating bad subtrees.
///
/// An unusable document (wrong type tag, incompatible major version,
/// malformed attributes) yields a stub placeholder job carrying `id`, plus
/// the recorded errors. Component specs are reconciled against the plugin
/// registry recursively, so a single unknown backend on one subjob never
/// prevents loading its siblings.
pub fn from_document(id: JobId, doc: Document, plugins: &PluginRegistry) -> LoadResult<Job> {
    let mut errors = Vec::new();

    if doc.type_name != JOB_TYPE {
        errors.push(LoadError::new(
            "type",
            format!("expected '{JOB_TYPE}', found '{}'", doc.type_name),
        ));
        return LoadResult::with_errors(stub_job(id), errors);
    }
    if !doc.version.is_loadable(JOB_SCHEMA_VERSION) {
        errors.push(LoadError::new(
            "version",
            format!(
                "schema version {} is not loadable (current {})",
                doc.version, JOB_SCHEMA_VERSION
            ),
        ));
        return LoadResult::with_errors(stub_job(id), errors);
    }

    let mut job: Job = match serde_json::from_value(Value::Object(doc.attrs)) {
        Ok(job) => job,
        Err(e) => {
            errors.push(LoadError::new("attrs", e.to_string()));
            return LoadResult::with_errors(stub_job(id), errors);
        }
    };

    reconcile_components(&mut job, "", plugins, &mut errors);
    job.relink_subjobs();
    LoadResult::with_errors(job, errors)
}

fn reconcile_components(
    job: &mut Job,
    prefix: &str,
    plugins: &PluginRegistry,
    errors: &mut Vec<LoadError>,
) {
    let app = std::mem::replace(
        &mut job.application,
        ComponentSpec::minimal("applications", ""),
    );
    job.application = plugins.reconcile(app, &format!("{prefix}application"), errors);

    let backend = std::mem::replace(&mut job.backend, ComponentSpec::minimal("backends", ""));
    job.backend = plugins.reconcile(backend, &format!("{prefix}backend"), errors);

    for (i, sub) in job.subjobs.iter_mut().enumerate() {
        let sub_prefix = format!("{prefix}subjobs[{i}].");
        reconcile_components(sub, &sub_prefix, plugins, errors);
    }
}

/// Placeholder standing in for a record that could not be loaded. Keeps the
/// id so the registry slot stays occupied and the record can be removed or
/// inspected by the user.
pub fn stub_job(id: JobId) -> Job {
    let mut job = Job::new(
        "unloadable",
        ComponentSpec::placeholder("applications", "unknown"),
        ComponentSpec::placeholder("backends", "unknown"),
    );
    job.id = id;
    job
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{FileRef, JobStatus, PluginRegistry};

    fn plugins() -> PluginRegistry {
        PluginRegistry::with_builtins()
    }

    fn sample_job() -> Job {
        let registry = plugins();
        let mut job = Job::new(
            "analysis",
            registry.build("applications", "Executable").unwrap(),
            registry.build("backends", "Local").unwrap(),
        );
        job.id = JobId::new(4);
        job.inputfiles = vec![FileRef::new("data-*.root")];
        job.outputfiles = vec![FileRef::new("hist.root")];
        for i in 0..2 {
            let mut sub = Job::new(
                format!("analysis.{i}"),
                registry.build("applications", "Executable").unwrap(),
                registry.build("backends", "Local").unwrap(),
            );
            sub.id = JobId::new(i);
            sub.master = Some(job.id);
            job.subjobs.push(sub);
        }
        job
    }

    #[test]
    fn round_trip_preserves_all_visitable_attributes() {
        let job = sample_job();
        let doc = to_document(&job).unwrap();
        let text = serde_json::to_string_pretty(&doc).unwrap();
        let parsed: Document = serde_json::from_str(&text).unwrap();
        let loaded = from_document(job.id, parsed, &plugins());
        assert!(loaded.is_clean(), "errors: {:?}", loaded.errors);
        assert_eq!(loaded.value, job);
    }

    #[test]
    fn round_trip_covers_value_kinds() {
        let registry = plugins();
        let mut job = sample_job();
        // string, int, bool, null, sequence
        job.application = registry
            .build("applications", "Executable")
            .unwrap()
            .with_field("label", serde_json::json!("x y\n\"z\""))
            .with_field("cores", serde_json::json!(8))
            .with_field("verbose", serde_json::json!(true))
            .with_field("comment", serde_json::json!(null))
            .with_field("args", serde_json::json!(["-a", 1, false]));
        let doc = to_document(&job).unwrap();
        let loaded = from_document(job.id, doc, &registry);
        assert!(loaded.is_clean());
        assert_eq!(loaded.value, job);
    }

    #[test]
    fn master_back_reference_is_not_serialized() {
        let job = sample_job();
        let doc = to_document(&job).unwrap();
        let subjobs = doc.attrs.get("subjobs").unwrap().as_array().unwrap();
        assert!(subjobs[0].get("master").is_none());
        // but it is rebuilt on load
        let loaded = from_document(job.id, doc, &plugins());
        assert_eq!(loaded.value.subjobs[0].master, Some(job.id));
    }

    #[test]
    fn unknown_subjob_backend_is_isolated() {
        let mut job = sample_job();
        job.subjobs[1].backend = ComponentSpec::minimal("backends", "Gridway");
        let doc = to_document(&job).unwrap();
        let loaded = from_document(job.id, doc, &plugins());
        assert_eq!(loaded.errors.len(), 1);
        assert_eq!(loaded.errors[0].path, "subjobs[1].backend");
        // sibling subjob and the master itself load intact
        assert!(!loaded.value.subjobs[0].backend.is_placeholder());
        assert!(loaded.value.subjobs[1].backend.is_placeholder());
        assert_eq!(loaded.value.name, "analysis");
    }

    #[test]
    fn incompatible_major_version_yields_stub() {
        let job = sample_job();
        let mut doc = to_document(&job).unwrap();
        doc.version = SchemaVersion::new(9, 0);
        let loaded = from_document(job.id, doc, &plugins());
        assert_eq!(loaded.errors.len(), 1);
        assert_eq!(loaded.value.id, job.id);
        assert_eq!(loaded.value.name, "unloadable");
        assert!(loaded.value.application.is_placeholder());
    }

    #[test]
    fn malformed_attrs_yield_stub_with_error() {
        let mut doc = Document::new(JOB_TYPE, JOB_SCHEMA_VERSION, JOB_CATEGORY);
        doc.attrs
            .insert("id".into(), serde_json::json!("not-a-number"));
        let loaded = from_document(JobId::new(9), doc, &plugins());
        assert_eq!(loaded.value.id, JobId::new(9));
        assert!(!loaded.is_clean());
    }

    #[test]
    fn status_survives_round_trip() {
        let mut job = sample_job();
        job.force_status(JobStatus::Submitting);
        job.force_status(JobStatus::Submitted);
        let doc = to_document(&job).unwrap();
        let loaded = from_document(job.id, doc, &plugins());
        assert_eq!(loaded.value.status, JobStatus::Submitted);
        assert!(loaded.value.time.contains_key("submitted"));
    }
}
