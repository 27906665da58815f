//! gRPC CSI Connection
//!
//! Talks to a CSI driver over its Unix domain socket using `tonic`.

use super::proto::{
    self, controller_service_capability, plugin_capability, volume_capability,
};
use crate::domain::ports::{
    AccessMode, AccessType, ControllerCapability, PluginCapability, PluginConnection,
    PublishRequest, UnpublishRequest, VolumeCapability,
};
use crate::error::{Error, Result};
use async_trait::async_trait;
use hyper_util::rt::TokioIo;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UnixStream;
use tokio_util::sync::{CancellationToken, DropGuard};
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

// =============================================================================
// RPC Paths
// =============================================================================

const GET_PLUGIN_INFO: &str = "/csi.v1.Identity/GetPluginInfo";
const GET_PLUGIN_CAPABILITIES: &str = "/csi.v1.Identity/GetPluginCapabilities";
const PROBE: &str = "/csi.v1.Identity/Probe";
const CONTROLLER_GET_CAPABILITIES: &str = "/csi.v1.Controller/ControllerGetCapabilities";
const CONTROLLER_PUBLISH_VOLUME: &str = "/csi.v1.Controller/ControllerPublishVolume";
const CONTROLLER_UNPUBLISH_VOLUME: &str = "/csi.v1.Controller/ControllerUnpublishVolume";

// =============================================================================
// CSI Connection
// =============================================================================

/// Connection to a CSI driver socket
#[derive(Clone)]
pub struct CsiConnection {
    address: String,
    channel: Channel,
    lost: CancellationToken,
}

impl CsiConnection {
    /// Connect to the driver socket at `address` (`/path` or `unix:///path`)
    pub async fn connect(address: &str) -> Result<Self> {
        let path = socket_path(address)?;
        info!("Connecting to CSI driver at {}", path.display());

        let lost = CancellationToken::new();
        let alive = lost.clone();

        // The authority is ignored; every connection goes to the socket.
        let channel = Endpoint::from_static("http://[::]:50051")
            .connect_with_connector(service_fn(move |_: Uri| {
                let path = path.clone();
                let alive = alive.clone();
                async move {
                    let stream = UnixStream::connect(path).await?;
                    Ok::<_, std::io::Error>(TokioIo::new(TrackedStream::new(stream, alive)))
                }
            }))
            .await
            .map_err(|e| Error::PluginConnection {
                address: address.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            address: address.to_string(),
            channel,
            lost,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn unary<Req, Resp>(&self, path: &'static str, request: Req) -> Result<Resp>
    where
        Req: prost::Message + Send + Sync + 'static,
        Resp: prost::Message + Default + Send + Sync + 'static,
    {
        let operation = operation_name(path);
        let mut grpc = tonic::client::Grpc::new(self.channel.clone());
        grpc.ready().await.map_err(|e| Error::PluginRpc {
            operation: operation.to_string(),
            code: tonic::Code::Unavailable,
            message: format!("service was not ready: {}", e),
        })?;

        debug!("CSI call {}", operation);
        let codec = tonic_prost::ProstCodec::<Req, Resp>::default();
        let response = grpc
            .unary(
                tonic::Request::new(request),
                PathAndQuery::from_static(path),
                codec,
            )
            .await
            .map_err(|status| Error::from_status(operation, status))?;

        Ok(response.into_inner())
    }
}

#[async_trait]
impl PluginConnection for CsiConnection {
    async fn probe(&self) -> Result<bool> {
        let response: proto::ProbeResponse = self.unary(PROBE, proto::ProbeRequest {}).await?;
        Ok(response.ready.unwrap_or(true))
    }

    async fn get_identity(&self) -> Result<String> {
        let response: proto::GetPluginInfoResponse = self
            .unary(GET_PLUGIN_INFO, proto::GetPluginInfoRequest {})
            .await?;
        Ok(response.name)
    }

    async fn get_plugin_capabilities(&self) -> Result<BTreeSet<PluginCapability>> {
        let response: proto::GetPluginCapabilitiesResponse = self
            .unary(GET_PLUGIN_CAPABILITIES, proto::GetPluginCapabilitiesRequest {})
            .await?;
        Ok(plugin_capabilities(&response))
    }

    async fn get_controller_capabilities(&self) -> Result<BTreeSet<ControllerCapability>> {
        let response: proto::ControllerGetCapabilitiesResponse = self
            .unary(
                CONTROLLER_GET_CAPABILITIES,
                proto::ControllerGetCapabilitiesRequest {},
            )
            .await?;
        Ok(controller_capabilities(&response))
    }

    async fn publish(&self, request: PublishRequest) -> Result<BTreeMap<String, String>> {
        let request = proto::ControllerPublishVolumeRequest {
            volume_id: request.volume_id,
            node_id: request.node_id,
            volume_capability: Some(to_proto_capability(&request.capability)),
            readonly: request.read_only,
            secrets: request.secrets.into_iter().collect(),
            volume_context: request.volume_context.into_iter().collect(),
        };
        let response: proto::ControllerPublishVolumeResponse =
            self.unary(CONTROLLER_PUBLISH_VOLUME, request).await?;
        Ok(response.publish_context.into_iter().collect())
    }

    async fn unpublish(&self, request: UnpublishRequest) -> Result<()> {
        let request = proto::ControllerUnpublishVolumeRequest {
            volume_id: request.volume_id,
            node_id: request.node_id,
            secrets: request.secrets.into_iter().collect(),
        };
        let _: proto::ControllerUnpublishVolumeResponse =
            self.unary(CONTROLLER_UNPUBLISH_VOLUME, request).await?;
        Ok(())
    }

    fn connection_lost(&self) -> Option<CancellationToken> {
        Some(self.lost.clone())
    }
}

// =============================================================================
// Tracked Stream
// =============================================================================

/// Socket that cancels its token when the transport drops it
struct TrackedStream {
    stream: UnixStream,
    _alive: DropGuard,
}

impl TrackedStream {
    fn new(stream: UnixStream, alive: CancellationToken) -> Self {
        Self {
            stream,
            _alive: alive.drop_guard(),
        }
    }
}

impl AsyncRead for TrackedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TrackedStream {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Resolve the filesystem path of the driver socket
pub fn socket_path(address: &str) -> Result<PathBuf> {
    let path = match address.split_once("://") {
        None => address,
        Some(("unix", path)) => path,
        Some((scheme, _)) => {
            return Err(Error::Configuration(format!(
                "unsupported CSI address scheme {:?} in {}, only unix sockets are supported",
                scheme, address
            )))
        }
    };

    if path.is_empty() {
        return Err(Error::Configuration("empty CSI address".into()));
    }
    Ok(PathBuf::from(path))
}

fn operation_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn plugin_capabilities(
    response: &proto::GetPluginCapabilitiesResponse,
) -> BTreeSet<PluginCapability> {
    use plugin_capability::service::Type;

    response
        .capabilities
        .iter()
        .filter_map(|cap| match &cap.r#type {
            Some(plugin_capability::Type::Service(service)) => {
                match Type::try_from(service.r#type).ok()? {
                    Type::ControllerService => Some(PluginCapability::ControllerService),
                    Type::VolumeAccessibilityConstraints => {
                        Some(PluginCapability::VolumeAccessibilityConstraints)
                    }
                    Type::GroupControllerService => Some(PluginCapability::GroupControllerService),
                    Type::Unknown => None,
                }
            }
            None => None,
        })
        .collect()
}

fn controller_capabilities(
    response: &proto::ControllerGetCapabilitiesResponse,
) -> BTreeSet<ControllerCapability> {
    use controller_service_capability::rpc::Type;

    response
        .capabilities
        .iter()
        .filter_map(|cap| match &cap.r#type {
            Some(controller_service_capability::Type::Rpc(rpc)) => {
                let capability = match Type::try_from(rpc.r#type).ok()? {
                    Type::Unknown => return None,
                    Type::CreateDeleteVolume => ControllerCapability::CreateDeleteVolume,
                    Type::PublishUnpublishVolume => ControllerCapability::PublishUnpublishVolume,
                    Type::ListVolumes => ControllerCapability::ListVolumes,
                    Type::GetCapacity => ControllerCapability::GetCapacity,
                    Type::CreateDeleteSnapshot => ControllerCapability::CreateDeleteSnapshot,
                    Type::ListSnapshots => ControllerCapability::ListSnapshots,
                    Type::CloneVolume => ControllerCapability::CloneVolume,
                    Type::PublishReadonly => ControllerCapability::PublishReadonly,
                    Type::ExpandVolume => ControllerCapability::ExpandVolume,
                    Type::ListVolumesPublishedNodes => {
                        ControllerCapability::ListVolumesPublishedNodes
                    }
                    Type::VolumeCondition => ControllerCapability::VolumeCondition,
                    Type::GetVolume => ControllerCapability::GetVolume,
                    Type::SingleNodeMultiWriter => ControllerCapability::SingleNodeMultiWriter,
                };
                Some(capability)
            }
            None => None,
        })
        .collect()
}

fn to_proto_capability(capability: &VolumeCapability) -> proto::VolumeCapability {
    use volume_capability::access_mode::Mode;

    let access_type = match &capability.access_type {
        AccessType::Block => {
            volume_capability::AccessType::Block(volume_capability::BlockVolume {})
        }
        AccessType::Mount {
            fs_type,
            mount_flags,
        } => volume_capability::AccessType::Mount(volume_capability::MountVolume {
            fs_type: fs_type.clone(),
            mount_flags: mount_flags.clone(),
            volume_mount_group: String::new(),
        }),
    };

    let mode = match capability.access_mode {
        AccessMode::SingleNodeWriter => Mode::SingleNodeWriter,
        AccessMode::SingleNodeReaderOnly => Mode::SingleNodeReaderOnly,
        AccessMode::MultiNodeReaderOnly => Mode::MultiNodeReaderOnly,
        AccessMode::MultiNodeSingleWriter => Mode::MultiNodeSingleWriter,
        AccessMode::MultiNodeMultiWriter => Mode::MultiNodeMultiWriter,
    };

    proto::VolumeCapability {
        access_mode: Some(volume_capability::AccessMode { mode: mode as i32 }),
        access_type: Some(access_type),
    }
}
