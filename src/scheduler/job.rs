use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{FarmError, Result};

/// Identifier assigned by the queue at enqueue time.
pub type JobId = u64;

/// Position of a worker in the pool, surfaced to observers as `slotId`.
pub type SlotId = u32;

/// Where the APK under test comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApkSource {
    Local,
    Registry,
}

impl fmt::Display for ApkSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApkSource::Local => write!(f, "local"),
            ApkSource::Registry => write!(f, "registry"),
        }
    }
}

/// Where test devices come from. Only locally sourced devices are part of
/// the affinity key, since only they need an exclusive lock on this host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSource {
    #[default]
    Local,
    Remote,
}

impl fmt::Display for DeviceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSource::Local => write!(f, "local"),
            DeviceSource::Remote => write!(f, "remote"),
        }
    }
}

/// A job as submitted, before the queue gives it an identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    pub branch: String,
    pub client: String,
    pub feature: String,
    pub apk_identifier: String,
    pub apk_source: ApkSource,
    #[serde(default)]
    pub device_serial: Option<String>,
    #[serde(default)]
    pub record: bool,
    #[serde(default)]
    pub quick_test: bool,
}

impl JobSpec {
    pub fn new(branch: &str, client: &str, feature: &str, apk_identifier: &str) -> Self {
        Self {
            branch: branch.to_string(),
            client: client.to_string(),
            feature: feature.to_string(),
            apk_identifier: apk_identifier.to_string(),
            apk_source: ApkSource::Registry,
            device_serial: None,
            record: false,
            quick_test: false,
        }
    }

    pub fn with_apk_source(mut self, apk_source: ApkSource) -> Self {
        self.apk_source = apk_source;
        self
    }

    pub fn with_device(mut self, serial: &str) -> Self {
        self.device_serial = Some(serial.to_string());
        self
    }

    pub fn with_record(mut self, record: bool) -> Self {
        self.record = record;
        self
    }

    pub fn with_quick_test(mut self, quick_test: bool) -> Self {
        self.quick_test = quick_test;
        self
    }

    /// Reject specs no worker could ever satisfy.
    pub fn validate(&self, device_source: DeviceSource) -> Result<()> {
        let required = [
            ("branch", &self.branch),
            ("client", &self.client),
            ("feature", &self.feature),
            ("apkIdentifier", &self.apk_identifier),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(FarmError::InvalidJob(format!("{} must not be empty", field)));
            }
        }

        if device_source == DeviceSource::Local
            && self
                .device_serial
                .as_deref()
                .map_or(true, |s| s.trim().is_empty())
        {
            return Err(FarmError::InvalidJob(
                "deviceSerial is required when devices are sourced locally".to_string(),
            ));
        }

        Ok(())
    }
}

/// A unit of requested work.
///
/// `id` and the submitted fields never change after enqueue; only the
/// dispatch bookkeeping (`slot_id`, `attempts`) moves as the job travels
/// between the queue and workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub branch: String,
    pub client: String,
    pub feature: String,
    pub apk_identifier: String,
    pub apk_source: ApkSource,
    pub device_serial: Option<String>,
    pub record: bool,
    pub quick_test: bool,
    pub slot_id: Option<SlotId>,
    /// Number of times the job has been handed to a worker.
    pub attempts: u32,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn from_spec(id: JobId, spec: JobSpec) -> Self {
        Self {
            id,
            branch: spec.branch,
            client: spec.client,
            feature: spec.feature,
            apk_identifier: spec.apk_identifier,
            apk_source: spec.apk_source,
            device_serial: spec.device_serial,
            record: spec.record,
            quick_test: spec.quick_test,
            slot_id: None,
            attempts: 0,
            submitted_at: Utc::now(),
        }
    }

    pub fn affinity_key(&self, device_source: DeviceSource) -> AffinityKey {
        AffinityKey {
            branch: self.branch.clone(),
            client: self.client.clone(),
            apk_identifier: self.apk_identifier.clone(),
            apk_source: self.apk_source,
            device_serial: match device_source {
                DeviceSource::Local => self.device_serial.clone(),
                DeviceSource::Remote => None,
            },
        }
    }
}

/// The tuple that decides whether a job and a worker are compatible.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffinityKey {
    pub branch: String,
    pub client: String,
    pub apk_identifier: String,
    pub apk_source: ApkSource,
    pub device_serial: Option<String>,
}

impl fmt::Display for AffinityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}({})",
            self.branch, self.client, self.apk_identifier, self.apk_source
        )?;
        if let Some(serial) = &self.device_serial {
            write!(f, "@{}", serial)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn affinity_ignores_device_when_remote() {
        let job = Job::from_spec(1, JobSpec::new("main", "c1", "login.feature", "v1").with_device("emu-1"));
        assert_eq!(
            job.affinity_key(DeviceSource::Local).device_serial.as_deref(),
            Some("emu-1")
        );
        assert!(job.affinity_key(DeviceSource::Remote).device_serial.is_none());
    }

    #[test]
    fn validate_requires_device_for_local_sourcing() {
        let spec = JobSpec::new("main", "c1", "login.feature", "v1");
        assert!(matches!(
            spec.validate(DeviceSource::Local),
            Err(FarmError::InvalidJob(_))
        ));
        assert!(spec.validate(DeviceSource::Remote).is_ok());
        assert!(spec.with_device("emu-1").validate(DeviceSource::Local).is_ok());
    }

    #[test]
    fn validate_rejects_blank_fields() {
        let spec = JobSpec::new("main", " ", "login.feature", "v1");
        let err = spec.validate(DeviceSource::Remote).unwrap_err();
        assert!(err.to_string().contains("client"));
    }

    #[test]
    fn job_serializes_camel_case() {
        let job = Job::from_spec(7, JobSpec::new("main", "c1", "a.feature", "v1").with_quick_test(true));
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["apkIdentifier"], "v1");
        assert_eq!(value["apkSource"], "registry");
        assert_eq!(value["quickTest"], true);
        assert!(value["slotId"].is_null());
    }

    #[test]
    fn affinity_key_display() {
        let job = Job::from_spec(1, JobSpec::new("main", "c1", "a.feature", "v1").with_device("emu-1"));
        assert_eq!(
            job.affinity_key(DeviceSource::Local).to_string(),
            "main/c1/v1(registry)@emu-1"
        );
    }
}
