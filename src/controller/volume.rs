//! Volume Helpers
//!
//! Pure functions that turn cached cluster objects into driver requests
//! and status patches.

use crate::domain::ports::{AccessMode, AccessType, DriverIdentity, VolumeCapability};
use crate::error::{Error, Result};
use crate::leaderelection::sanitize_name;
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::{CSIPersistentVolumeSource, Node, PersistentVolume};
use k8s_openapi::api::storage::v1::{CSINode, VolumeAttachment};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Node annotation mapping driver names to node IDs
pub const NODE_ID_ANNOTATION: &str = "csi.volume.kubernetes.io/nodeid";

/// Node ID recorded on the attachment so detach works after the node is gone
pub const ATTACHMENT_NODE_ID_ANNOTATION: &str = "csi.alpha.kubernetes.io/node-id";

pub fn finalizer_name(driver: &DriverIdentity) -> String {
    format!("external-attacher/{}", sanitize_name(driver.as_str()))
}

pub fn has_finalizer(finalizers: Option<&Vec<String>>, finalizer: &str) -> bool {
    finalizers.is_some_and(|f| f.iter().any(|name| name == finalizer))
}

pub fn attachment_name(va: &VolumeAttachment) -> String {
    va.metadata.name.clone().unwrap_or_default()
}

/// PersistentVolume the attachment refers to
pub fn pv_name(va: &VolumeAttachment) -> Result<&str> {
    va.spec
        .source
        .persistent_volume_name
        .as_deref()
        .ok_or_else(|| Error::InvalidAttachment {
            name: attachment_name(va),
            reason: "only PersistentVolume sources are supported".into(),
        })
}

/// CSI source of a volume, which must belong to `driver`
pub fn csi_source<'a>(
    pv: &'a PersistentVolume,
    driver: &DriverIdentity,
) -> Result<&'a CSIPersistentVolumeSource> {
    let name = pv.metadata.name.clone().unwrap_or_default();
    let source = pv
        .spec
        .as_ref()
        .and_then(|spec| spec.csi.as_ref())
        .ok_or_else(|| Error::InvalidAttachment {
            name: name.clone(),
            reason: "PersistentVolume is not a CSI volume".into(),
        })?;
    if source.driver != driver.as_str() {
        return Err(Error::InvalidAttachment {
            name,
            reason: format!("volume belongs to driver {}", source.driver),
        });
    }
    Ok(source)
}

/// Whether a PV references `driver`
pub fn is_driver_volume(pv: &PersistentVolume, driver: &DriverIdentity) -> bool {
    pv.spec
        .as_ref()
        .and_then(|spec| spec.csi.as_ref())
        .is_some_and(|csi| csi.driver == driver.as_str())
}

/// Volume is read-only if its source says so or it only allows ROX
pub fn is_read_only(pv: &PersistentVolume, source: &CSIPersistentVolumeSource) -> bool {
    let only_rox = pv
        .spec
        .as_ref()
        .and_then(|spec| spec.access_modes.as_ref())
        .is_some_and(|modes| !modes.is_empty() && modes.iter().all(|m| m == "ReadOnlyMany"));
    source.read_only.unwrap_or(false) || only_rox
}

/// Capability derived from the PV's volume mode and access modes
pub fn volume_capability(pv: &PersistentVolume, source: &CSIPersistentVolumeSource) -> Result<VolumeCapability> {
    let name = pv.metadata.name.clone().unwrap_or_default();
    let spec = pv.spec.as_ref().ok_or_else(|| Error::InvalidAttachment {
        name: name.clone(),
        reason: "PersistentVolume has no spec".into(),
    })?;

    let access_type = if spec.volume_mode.as_deref() == Some("Block") {
        AccessType::Block
    } else {
        AccessType::Mount {
            fs_type: source.fs_type.clone().unwrap_or_default(),
            mount_flags: spec.mount_options.clone().unwrap_or_default(),
        }
    };

    let modes = spec.access_modes.clone().unwrap_or_default();
    let has = |mode: &str| modes.iter().any(|m| m == mode);
    let access_mode = if has("ReadWriteMany") {
        AccessMode::MultiNodeMultiWriter
    } else if has("ReadWriteOnce") && has("ReadOnlyMany") {
        AccessMode::MultiNodeSingleWriter
    } else if has("ReadOnlyMany") {
        AccessMode::MultiNodeReaderOnly
    } else if has("ReadWriteOnce") || has("ReadWriteOncePod") {
        AccessMode::SingleNodeWriter
    } else {
        return Err(Error::InvalidAttachment {
            name,
            reason: format!("unsupported access modes {:?}", modes),
        });
    };

    Ok(VolumeCapability {
        access_type,
        access_mode,
    })
}

/// Driver-side ID of a node.
///
/// Looked up in the CSINode registration first, then the node annotation,
/// then the ID remembered on the attachment itself.
pub fn node_id(
    node_name: &str,
    driver: &DriverIdentity,
    csi_node: Option<&CSINode>,
    node: Option<&Node>,
    va: Option<&VolumeAttachment>,
) -> Result<String> {
    let registered = csi_node.and_then(|csi_node| {
        csi_node
            .spec
            .drivers
            .iter()
            .find(|d| d.name == driver.as_str())
            .map(|d| d.node_id.clone())
    });
    if let Some(id) = registered.filter(|id| !id.is_empty()) {
        return Ok(id);
    }

    let annotated = node
        .and_then(|node| node.metadata.annotations.as_ref())
        .and_then(|a| a.get(NODE_ID_ANNOTATION))
        .and_then(|raw| serde_json::from_str::<BTreeMap<String, String>>(raw).ok())
        .and_then(|mut ids| ids.remove(driver.as_str()));
    if let Some(id) = annotated.filter(|id| !id.is_empty()) {
        return Ok(id);
    }

    let remembered = va
        .and_then(|va| va.metadata.annotations.as_ref())
        .and_then(|a| a.get(ATTACHMENT_NODE_ID_ANNOTATION))
        .cloned();
    if let Some(id) = remembered.filter(|id| !id.is_empty()) {
        return Ok(id);
    }

    Err(Error::NodeIdUnavailable {
        node: node_name.to_string(),
        driver: driver.to_string(),
    })
}

// =============================================================================
// Status Patches
// =============================================================================

fn volume_error(message: &str) -> Value {
    json!({
        "time": Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        "message": message,
    })
}

pub fn attached_status(metadata: &BTreeMap<String, String>) -> Value {
    json!({
        "attached": true,
        "attachmentMetadata": if metadata.is_empty() { Value::Null } else { json!(metadata) },
        "attachError": null,
    })
}

pub fn attach_error_status(message: &str) -> Value {
    json!({ "attachError": volume_error(message) })
}

pub fn detached_status() -> Value {
    json!({
        "attached": false,
        "attachmentMetadata": null,
        "detachError": null,
    })
}

pub fn detach_error_status(message: &str) -> Value {
    json!({ "detachError": volume_error(message) })
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use k8s_openapi::api::core::v1::{PersistentVolumeSpec, SecretReference};
    use k8s_openapi::api::storage::v1::{
        CSINodeDriver, CSINodeSpec, VolumeAttachmentSource, VolumeAttachmentSpec,
        VolumeAttachmentStatus,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    pub const DRIVER: &str = "hostpath.csi.k8s.io";

    pub fn driver() -> DriverIdentity {
        DriverIdentity::new(DRIVER).unwrap()
    }

    pub fn attachment(name: &str, pv: &str, node: &str) -> VolumeAttachment {
        VolumeAttachment {
            metadata: ObjectMeta {
                name: Some(name.into()),
                resource_version: Some("1".into()),
                ..Default::default()
            },
            spec: VolumeAttachmentSpec {
                attacher: DRIVER.into(),
                node_name: node.into(),
                source: VolumeAttachmentSource {
                    persistent_volume_name: Some(pv.into()),
                    ..Default::default()
                },
            },
            status: Some(VolumeAttachmentStatus::default()),
        }
    }

    pub fn volume(name: &str, modes: &[&str]) -> PersistentVolume {
        PersistentVolume {
            metadata: ObjectMeta {
                name: Some(name.into()),
                resource_version: Some("1".into()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeSpec {
                access_modes: Some(modes.iter().map(|m| m.to_string()).collect()),
                csi: Some(CSIPersistentVolumeSource {
                    driver: DRIVER.into(),
                    volume_handle: format!("handle-{}", name),
                    fs_type: Some("ext4".into()),
                    controller_publish_secret_ref: Some(SecretReference {
                        name: Some("publish-secret".into()),
                        namespace: Some("storage".into()),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            status: None,
        }
    }

    pub fn csi_node(node: &str, id: &str) -> CSINode {
        CSINode {
            metadata: ObjectMeta {
                name: Some(node.into()),
                ..Default::default()
            },
            spec: CSINodeSpec {
                drivers: vec![CSINodeDriver {
                    name: DRIVER.into(),
                    node_id: id.into(),
                    ..Default::default()
                }],
            },
        }
    }
}
