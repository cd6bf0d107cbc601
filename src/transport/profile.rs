// Capability Profile
// Services and attributes reported by capability discovery, used to vet operations before dispatch

use crate::transport::TargetId;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ============================================================================
// SERVICE AND ATTRIBUTE
// ============================================================================

/// A discovered service and its attributes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceProfile {
    uuid: Uuid,
    attributes: Vec<AttributeProfile>,
}

impl ServiceProfile {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            attributes: Vec::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn attributes(&self) -> &[AttributeProfile] {
        &self.attributes
    }

    pub fn with_attribute(mut self, attribute: AttributeProfile) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn attribute(&self, uuid: &Uuid) -> Option<&AttributeProfile> {
        self.attributes.iter().find(|a| &a.uuid == uuid)
    }
}

/// A discovered attribute with its capability flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeProfile {
    uuid: Uuid,
    read: bool,
    write: bool,
    write_without_response: bool,
    notify: bool,
    indicate: bool,
    descriptors: Vec<Uuid>,
}

impl AttributeProfile {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            read: false,
            write: false,
            write_without_response: false,
            notify: false,
            indicate: false,
            descriptors: Vec::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn with_read(mut self) -> Self {
        self.read = true;
        self
    }

    pub fn with_write(mut self) -> Self {
        self.write = true;
        self
    }

    pub fn with_write_without_response(mut self) -> Self {
        self.write_without_response = true;
        self
    }

    pub fn with_notify(mut self) -> Self {
        self.notify = true;
        self
    }

    pub fn with_indicate(mut self) -> Self {
        self.indicate = true;
        self
    }

    pub fn with_descriptor(mut self, uuid: Uuid) -> Self {
        self.descriptors.push(uuid);
        self
    }

    pub fn can_read(&self) -> bool {
        self.read
    }

    /// Either acknowledged or unacknowledged writes
    pub fn can_write(&self) -> bool {
        self.write || self.write_without_response
    }

    pub fn can_notify(&self) -> bool {
        self.notify
    }

    pub fn can_indicate(&self) -> bool {
        self.indicate
    }

    pub fn descriptors(&self) -> &[Uuid] {
        &self.descriptors
    }

    pub fn has_descriptor(&self, uuid: &Uuid) -> bool {
        self.descriptors.contains(uuid)
    }
}

/// Look up the attribute a target points at
pub fn find_attribute<'a>(
    services: &'a [ServiceProfile],
    target: &TargetId,
) -> Option<&'a AttributeProfile> {
    services
        .iter()
        .find(|s| s.uuid == target.service)
        .and_then(|s| s.attribute(&target.attribute))
}
