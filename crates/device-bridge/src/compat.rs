//! Project/device compatibility

use serde::{Deserialize, Serialize};

use crate::device::DeviceProfile;
use crate::status::Severity;

/// What a project needs from a device
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRequirements {
    pub name: String,
    /// Minimum SDK level the project supports
    pub min_api: Option<u32>,
    /// Platform the project is built against, e.g. "android-34"
    pub target_hash: Option<String>,
}

impl ProjectRequirements {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_min_api(mut self, level: u32) -> Self {
        self.min_api = Some(level);
        self
    }

    pub fn with_target(mut self, target_hash: impl Into<String>) -> Self {
        self.target_hash = Some(target_hash.into());
        self
    }
}

/// Can `project` run on `device`?
///
/// `Cancel` when the project states no requirement at all, `Warning` when
/// the device's level is unknown or its platform differs from the target.
pub fn is_compatible(project: &ProjectRequirements, device: &DeviceProfile) -> Severity {
    if project.min_api.is_none() && project.target_hash.is_none() {
        return Severity::Cancel;
    }

    let details = device.details();
    let Some(api_level) = details.api_level else {
        return Severity::Warning;
    };

    if let Some(min_api) = project.min_api {
        if api_level < min_api {
            return Severity::Error;
        }
    }

    match (&project.target_hash, &details.target_hash) {
        (Some(wanted), Some(actual)) if wanted != actual => Severity::Warning,
        (Some(_), None) => Severity::Warning,
        _ => Severity::Ok,
    }
}
