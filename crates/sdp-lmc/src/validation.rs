//! Validation and parsing of subarray command payloads.
//!
//! Payloads name their schema in an `interface` URI such as
//! `https://schema.skao.int/ska-sdp-assignres/0.3`. Version 0.2 payloads are
//! rewritten to 0.3 key names before parsing, so the typed structs below
//! only describe 0.3.

use sdp_config::{Dependency, ProcessingBlock, ScanType, SchedulingBlockInstance, Workflow};
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, error, info};

use crate::error::{CommandError, CommandResult};

pub const MSG_VALIDATION_FAILED: &str = "Configuration validation failed";

const SCHEMA_HOSTS: &[&str] = &["https://schema.skatelescope.org", "https://schema.skao.int"];
pub const ASSIGNRES_PREFIX: &str = "ska-sdp-assignres/";
pub const CONFIGURE_PREFIX: &str = "ska-sdp-configure/";
pub const SCAN_PREFIX: &str = "ska-sdp-scan/";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SchemaVersion {
    V0_2,
    V0_3,
}

const DEFAULT_VERSION: SchemaVersion = SchemaVersion::V0_2;

// ── 0.3 payloads ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct AssignResources {
    eb_id: String,
    scan_types: Vec<ScanTypeConfig>,
    processing_blocks: Vec<ProcessingBlockConfig>,
}

#[derive(Debug, Deserialize)]
struct ScanTypeConfig {
    scan_type_id: String,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<ScanTypeConfig> for ScanType {
    fn from(config: ScanTypeConfig) -> Self {
        ScanType {
            id: config.scan_type_id,
            extra: config.extra,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProcessingBlockConfig {
    pb_id: String,
    workflow: WorkflowConfig,
    #[serde(default)]
    parameters: Value,
    dependencies: Option<Vec<DependencyConfig>>,
}

#[derive(Debug, Deserialize)]
struct WorkflowConfig {
    kind: String,
    name: String,
    version: String,
}

#[derive(Debug, Deserialize)]
struct DependencyConfig {
    pb_id: String,
    #[serde(default)]
    kind: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct Configure {
    new_scan_types: Option<Vec<ScanTypeConfig>>,
    scan_type: String,
}

#[derive(Debug, Deserialize)]
struct Scan {
    scan_id: i64,
}

// ── Public entry points ───────────────────────────────────────────

/// Validate an AssignResources payload into an SBI and its processing blocks.
pub fn validate_assign_resources(
    config: &str,
) -> CommandResult<(SchedulingBlockInstance, Vec<ProcessingBlock>)> {
    let (version, mut value) = validate_json_config(config, ASSIGNRES_PREFIX)?;
    if version == SchemaVersion::V0_2 {
        convert_assign_resources(&mut value);
    }
    let parsed: AssignResources = parse(value)?;
    Ok(parse_sbi_and_pbs(parsed))
}

/// Validate a Configure payload into new scan types and the selected one.
pub fn validate_configure(config: &str) -> CommandResult<(Option<Vec<ScanType>>, String)> {
    let (version, mut value) = validate_json_config(config, CONFIGURE_PREFIX)?;
    if version == SchemaVersion::V0_2 {
        if let Some(scan_types) = value.get_mut("new_scan_types") {
            convert_scan_types(scan_types);
        }
    }
    let parsed: Configure = parse(value)?;
    let new_scan_types = parsed
        .new_scan_types
        .map(|types| types.into_iter().map(ScanType::from).collect());
    Ok((new_scan_types, parsed.scan_type))
}

/// Validate a Scan payload into the scan id.
pub fn validate_scan(config: &str) -> CommandResult<i64> {
    let (version, mut value) = validate_json_config(config, SCAN_PREFIX)?;
    if version == SchemaVersion::V0_2 {
        rename(&mut value, "id", "scan_id");
    }
    let parsed: Scan = parse(value)?;
    if parsed.scan_id < 0 {
        error!(scan_id = parsed.scan_id, "scan id must not be negative");
        return Err(validation_failed());
    }
    Ok(parsed.scan_id)
}

// ── Helpers ───────────────────────────────────────────────────────

fn validation_failed() -> CommandError {
    CommandError::failed(MSG_VALIDATION_FAILED, module_path!())
}

/// Decode the payload and check its interface version.
fn validate_json_config(config: &str, prefix: &str) -> CommandResult<(SchemaVersion, Value)> {
    let value: Value = serde_json::from_str(config).map_err(|e| {
        error!(error = %e, "unable to decode configuration string as JSON");
        validation_failed()
    })?;
    if !value.is_object() {
        error!("configuration is not a JSON object");
        return Err(validation_failed());
    }
    let version = match value.get("interface") {
        None => DEFAULT_VERSION,
        Some(Value::String(uri)) => interface_version(uri, prefix).ok_or_else(|| {
            error!(interface = %uri, "schema version is not allowed");
            validation_failed()
        })?,
        Some(other) => {
            error!(interface = %other, "interface must be a string");
            return Err(validation_failed());
        }
    };
    debug!(?version, "validated JSON configuration");
    Ok((version, value))
}

fn interface_version(uri: &str, prefix: &str) -> Option<SchemaVersion> {
    let path = SCHEMA_HOSTS
        .iter()
        .find_map(|host| uri.strip_prefix(host)?.strip_prefix('/'))?;
    match path.strip_prefix(prefix)? {
        "0.2" => Some(SchemaVersion::V0_2),
        "0.3" => Some(SchemaVersion::V0_3),
        _ => None,
    }
}

fn parse<T: serde::de::DeserializeOwned>(value: Value) -> CommandResult<T> {
    serde_json::from_value(value).map_err(|e| {
        error!(error = %e, "unable to validate JSON configuration");
        validation_failed()
    })
}

fn rename(value: &mut Value, from: &str, to: &str) {
    if let Some(map) = value.as_object_mut() {
        if let Some(v) = map.remove(from) {
            map.insert(to.to_string(), v);
        }
    }
}

fn for_each_entry(value: Option<&mut Value>, mut f: impl FnMut(&mut Value)) {
    if let Some(Value::Array(entries)) = value {
        entries.iter_mut().for_each(&mut f);
    }
}

fn convert_scan_types(scan_types: &mut Value) {
    for_each_entry(Some(scan_types), |scan_type| {
        rename(scan_type, "id", "scan_type_id");
        rename(scan_type, "coordinate_system", "reference_frame");
    });
}

/// Rewrite 0.2 AssignResources keys to their 0.3 names.
fn convert_assign_resources(value: &mut Value) {
    rename(value, "id", "eb_id");
    if let Some(scan_types) = value.get_mut("scan_types") {
        convert_scan_types(scan_types);
    }
    for_each_entry(value.get_mut("processing_blocks"), |pb| {
        rename(pb, "id", "pb_id");
        if let Some(workflow) = pb.get_mut("workflow") {
            rename(workflow, "type", "kind");
            rename(workflow, "id", "name");
        }
        for_each_entry(pb.get_mut("dependencies"), |dependency| {
            rename(dependency, "type", "kind");
        });
    });
}

fn parse_sbi_and_pbs(config: AssignResources) -> (SchedulingBlockInstance, Vec<ProcessingBlock>) {
    let scan_types = config.scan_types.into_iter().map(ScanType::from).collect();
    let mut sbi = SchedulingBlockInstance::new(config.eb_id, scan_types);
    let mut pbs = Vec::with_capacity(config.processing_blocks.len());

    for pbc in config.processing_blocks {
        info!(pb_id = %pbc.pb_id, "parsing processing block");
        let kind = pbc.workflow.kind;
        match kind.as_str() {
            "realtime" => sbi.pb_realtime.push(pbc.pb_id.clone()),
            "batch" => sbi.pb_batch.push(pbc.pb_id.clone()),
            other => error!(kind = other, "unknown workflow type"),
        }

        let dependencies = match pbc.dependencies {
            Some(_) if kind == "realtime" => {
                error!(
                    pb_id = %pbc.pb_id,
                    "dependencies must not appear in a real-time processing block"
                );
                Vec::new()
            }
            Some(deps) if kind == "batch" => deps
                .into_iter()
                .map(|d| Dependency {
                    pb_id: d.pb_id,
                    kind: d.kind,
                })
                .collect(),
            _ => Vec::new(),
        };

        pbs.push(ProcessingBlock {
            id: pbc.pb_id,
            sbi_id: sbi.id.clone(),
            workflow: Workflow {
                kind,
                id: pbc.workflow.name,
                version: pbc.workflow.version,
            },
            parameters: pbc.parameters,
            dependencies,
        });
    }

    (sbi, pbs)
}
