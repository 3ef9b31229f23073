//! Device identity and the names derived from it
//!
//! The broker identifies a device by a fully qualified client id and scopes
//! every device topic under `/devices/<device_id>/`. Both are pure functions
//! of [`DeviceIdentity`].

use crate::config::ConfigError;

/// Identity of one device registered with the cloud broker
///
/// Immutable after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    project_id: String,
    region: String,
    registry_id: String,
    device_id: String,
}

impl DeviceIdentity {
    pub fn new(
        project_id: impl Into<String>,
        region: impl Into<String>,
        registry_id: impl Into<String>,
        device_id: impl Into<String>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            region: region.into(),
            registry_id: registry_id.into(),
            device_id: device_id.into(),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn registry_id(&self) -> &str {
        &self.registry_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Client id: `projects/<P>/locations/<R>/registries/<Reg>/devices/<D>`
    pub fn client_id(&self) -> String {
        format!(
            "projects/{}/locations/{}/registries/{}/devices/{}",
            self.project_id, self.region, self.registry_id, self.device_id
        )
    }

    /// Full topic for a device-relative topic: `/devices/<D>/<topic>`
    ///
    /// `user_topic` is inserted verbatim.
    pub fn device_topic(&self, user_topic: &str) -> String {
        format!("/devices/{}/{}", self.device_id, user_topic)
    }

    /// Check every identity field is usable inside a client id and a topic
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_field("project_id", &self.project_id)?;
        validate_field("region", &self.region)?;
        validate_field("registry_id", &self.registry_id)?;
        validate_field("device_id", &self.device_id)?;
        Ok(())
    }
}

fn validate_field(name: &str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(ConfigError::InvalidIdentity(format!("{name} must not be empty")));
    }

    // Path separators and MQTT wildcards would corrupt the derived names
    if value.chars().any(|c| matches!(c, '/' | '+' | '#') || c.is_whitespace()) {
        return Err(ConfigError::InvalidIdentity(format!(
            "{name} '{value}' must not contain '/', '+', '#' or whitespace"
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> DeviceIdentity {
        DeviceIdentity::new("my-project", "us-central1", "my-registry", "dev-42")
    }

    #[test]
    fn test_client_id_format() {
        assert_eq!(
            identity().client_id(),
            "projects/my-project/locations/us-central1/registries/my-registry/devices/dev-42"
        );
    }

    #[test]
    fn test_device_topic() {
        let identity = identity();
        assert_eq!(identity.device_topic("state"), "/devices/dev-42/state");
        assert_eq!(identity.device_topic("events/temp"), "/devices/dev-42/events/temp");
        assert_eq!(identity.device_topic("/state"), "/devices/dev-42//state");
    }

    #[test]
    fn test_validate_accepts_valid_identity() {
        assert!(identity().validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        let identity = DeviceIdentity::new("p", "", "reg", "dev");
        let err = identity.validate().unwrap_err();
        assert!(err.to_string().contains("region"));
    }

    #[test]
    fn test_validate_rejects_separators_and_wildcards() {
        for bad in ["a/b", "a+b", "a#", "a b"] {
            let identity = DeviceIdentity::new("p", "r", "reg", bad);
            assert!(
                identity.validate().is_err(),
                "device_id '{bad}' should be rejected"
            );
        }
    }
}
