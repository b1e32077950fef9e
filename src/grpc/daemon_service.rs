//! The `FleetDaemon` service implementation: every RPC the daemon answers,
//! including the public side of the tunnel stream.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};

use crate::error::FleetError;
use crate::grpc::dispatch::MethodDispatcher;
use crate::net::frame;
use crate::net::tunnel::LocalDispatcher;
use crate::net::ProxyClient;
use crate::node::NodeState;
use crate::proto::fleet_daemon_server::FleetDaemon;
use crate::proto::{
    CallRequest, CallResponse, DialRequest, DialResponse, FileSystemGetRequest,
    FileSystemGetResponse, FileSystemPutRequest, FileSystemPutResponse, FrameType, InfoRequest,
    InfoResponse, MarkRequest, MarkResponse, PingRequest, PingResponse, Process,
    ProcessFindRequest, ProcessFindResponse, ProcessKillRequest, ProcessKillResponse,
    ProcessListRequest, ProcessListResponse, ProcessSpawnRequest, ProcessSpawnResponse,
    ProcessSpawnType, SignalClearRequest, SignalClearResponse, SignalInfoRequest,
    SignalInfoResponse, SignalListRequest, SignalListResponse, SignalNotifyRequest,
    SignalNotifyResponse, SignalWaitRequest, SignalWaitResponse, TunnelFrame,
};
use crate::scheduler::{ProcessInfo, SpawnKind};

const TUNNEL_QUEUE: usize = 64;

pub struct FleetDaemonService {
    state: Arc<NodeState>,
    dispatcher: Arc<MethodDispatcher>,
}

impl FleetDaemonService {
    pub fn new(state: Arc<NodeState>) -> Self {
        let dispatcher = Arc::new(MethodDispatcher::new(state.clone()));
        Self { state, dispatcher }
    }
}

fn process_to_proto(info: ProcessInfo) -> Process {
    Process {
        pid: info.pid,
        state: info.state.to_string(),
        spec: info.spec,
        cmd: info.cmd,
    }
}

fn call_status(err: FleetError) -> Status {
    match err {
        FleetError::InvalidMethod(_) => Status::invalid_argument(err.to_string()),
        other => {
            tracing::warn!(err = %other, "call failed");
            Status::internal(FleetError::CallFailed.to_string())
        }
    }
}

#[tonic::async_trait]
impl FleetDaemon for FleetDaemonService {
    async fn ping(&self, _request: Request<PingRequest>) -> Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse {}))
    }

    async fn info(&self, _request: Request<InfoRequest>) -> Result<Response<InfoResponse>, Status> {
        Ok(Response::new(InfoResponse {
            name: self.state.name().to_string(),
            public: self.state.config().public,
            peer_count: self.state.registry().len() as u32,
        }))
    }

    async fn mark(&self, request: Request<MarkRequest>) -> Result<Response<MarkResponse>, Status> {
        let req = request.into_inner();
        self.state.mark(&req.name, &req.addr);
        Ok(Response::new(MarkResponse {}))
    }

    async fn dial(&self, request: Request<DialRequest>) -> Result<Response<DialResponse>, Status> {
        let req = request.into_inner();
        let from = req.from.unwrap_or_default();
        let to = req.to.unwrap_or_default();
        self.state.dial(&from, &to).await.map_err(|err| match err {
            FleetError::NoPublicRelay => Status::failed_precondition(err.to_string()),
            FleetError::NodeNotFound(_) => Status::not_found(err.to_string()),
            other => Status::internal(other.to_string()),
        })?;
        Ok(Response::new(DialResponse {}))
    }

    async fn call(&self, request: Request<CallRequest>) -> Result<Response<CallResponse>, Status> {
        let req = request.into_inner();
        tracing::info!(node = %req.node, method = %req.method, "call");
        let ret = self
            .dispatcher
            .dispatch(&req.node, &req.method, &req.args)
            .await
            .map_err(call_status)?;
        Ok(Response::new(CallResponse { ret }))
    }

    type TunnelStream = ReceiverStream<Result<TunnelFrame, Status>>;

    async fn tunnel(
        &self,
        request: Request<Streaming<TunnelFrame>>,
    ) -> Result<Response<Self::TunnelStream>, Status> {
        let remote = request
            .remote_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        let mut inbound = request.into_inner();
        let (out_tx, out_rx) = mpsc::channel::<Result<TunnelFrame, Status>>(TUNNEL_QUEUE);
        // Proxy clients write bare frames; bridge them into the response
        // stream so they share the single writer.
        let (frames_tx, mut frames_rx) = mpsc::channel::<TunnelFrame>(TUNNEL_QUEUE);

        let bridge = out_tx.clone();
        tokio::spawn(async move {
            while let Some(frame) = frames_rx.recv().await {
                if bridge.send(Ok(frame)).await.is_err() {
                    return;
                }
            }
        });

        let state = self.state.clone();
        let dispatcher = self.dispatcher.clone();
        tokio::spawn(async move {
            let mut peer: Option<String> = None;
            loop {
                let frame = match inbound.message().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::debug!(%err, "tunnel stream error");
                        break;
                    }
                };
                match FrameType::try_from(frame.r#type).unwrap_or(FrameType::Unknown) {
                    FrameType::Establish => match frame::parse_establish(&frame.body) {
                        Ok(est) => {
                            tracing::info!(name = %est.name, %remote, "tunnel established");
                            let proxy =
                                Arc::new(ProxyClient::new(&est.name, &remote, state.promise().clone()));
                            proxy.bind(frames_tx.clone());
                            // Re-establishment after a reconnect intentionally
                            // replaces the previous proxy binding.
                            state.registry().set_node(&est.name, proxy);
                            peer = Some(est.name);
                        }
                        Err(err) => tracing::warn!(%err, "malformed establish frame"),
                    },
                    FrameType::MethodCall => {
                        let call = match frame::parse_method_call(&frame.body) {
                            Ok(call) => call,
                            Err(err) => {
                                tracing::warn!(id = frame.id, %err, "malformed method call frame");
                                continue;
                            }
                        };
                        let dispatcher = dispatcher.clone();
                        let answer = frames_tx.clone();
                        tokio::spawn(async move {
                            let (method, args) = call.parts();
                            let body = match dispatcher.dispatch(&call.node, method, &args).await {
                                Ok(body) => body,
                                Err(err) => {
                                    tracing::warn!(id = frame.id, %err, "tunnel dispatch failed");
                                    format!("error: {err}")
                                }
                            };
                            if answer
                                .send(frame::method_return(frame.id, body))
                                .await
                                .is_err()
                            {
                                tracing::debug!(id = frame.id, "tunnel gone before answer");
                            }
                        });
                    }
                    FrameType::MethodReturn => state.promise().store(frame.id, frame.body),
                    FrameType::Unknown => {
                        tracing::debug!(id = frame.id, kind = frame.r#type, "unknown frame");
                    }
                }
            }
            if let Some(name) = peer {
                tracing::info!(%name, "tunnel peer disconnected");
            }
        });

        Ok(Response::new(ReceiverStream::new(out_rx)))
    }

    async fn signal_wait(
        &self,
        request: Request<SignalWaitRequest>,
    ) -> Result<Response<SignalWaitResponse>, Status> {
        let req = request.into_inner();
        Ok(Response::new(SignalWaitResponse {
            ok: self.state.signals().wait(&req.sig),
        }))
    }

    async fn signal_notify(
        &self,
        request: Request<SignalNotifyRequest>,
    ) -> Result<Response<SignalNotifyResponse>, Status> {
        let req = request.into_inner();
        self.state.signals().notify(&req.sig);
        Ok(Response::new(SignalNotifyResponse {}))
    }

    async fn signal_info(
        &self,
        request: Request<SignalInfoRequest>,
    ) -> Result<Response<SignalInfoResponse>, Status> {
        let req = request.into_inner();
        let (status, exist) = self.state.signals().info(&req.sig);
        Ok(Response::new(SignalInfoResponse { status, exist }))
    }

    async fn signal_list(
        &self,
        _request: Request<SignalListRequest>,
    ) -> Result<Response<SignalListResponse>, Status> {
        Ok(Response::new(SignalListResponse {
            sigs: self.state.signals().list(),
        }))
    }

    async fn signal_clear(
        &self,
        request: Request<SignalClearRequest>,
    ) -> Result<Response<SignalClearResponse>, Status> {
        let req = request.into_inner();
        self.state.signals().clear(&req.sigs);
        Ok(Response::new(SignalClearResponse {}))
    }

    async fn process_list(
        &self,
        _request: Request<ProcessListRequest>,
    ) -> Result<Response<ProcessListResponse>, Status> {
        let res = self
            .state
            .scheduler()
            .list()
            .into_iter()
            .map(process_to_proto)
            .collect();
        Ok(Response::new(ProcessListResponse { res }))
    }

    async fn process_kill(
        &self,
        request: Request<ProcessKillRequest>,
    ) -> Result<Response<ProcessKillResponse>, Status> {
        let req = request.into_inner();
        self.state.scheduler().kill(req.pid).map_err(|err| match err {
            FleetError::ProcessNotFound(_) => Status::not_found(err.to_string()),
            other => Status::internal(other.to_string()),
        })?;
        Ok(Response::new(ProcessKillResponse {}))
    }

    async fn process_find(
        &self,
        request: Request<ProcessFindRequest>,
    ) -> Result<Response<ProcessFindResponse>, Status> {
        let req = request.into_inner();
        let found: Vec<ProcessInfo> = if req.pid != 0 {
            self.state
                .scheduler()
                .find_by_pid(req.pid)
                .into_iter()
                .collect()
        } else {
            self.state.scheduler().find_by_cmd(&req.cmd)
        };
        Ok(Response::new(ProcessFindResponse {
            res: found.into_iter().map(process_to_proto).collect(),
        }))
    }

    async fn process_spawn(
        &self,
        request: Request<ProcessSpawnRequest>,
    ) -> Result<Response<ProcessSpawnResponse>, Status> {
        let req = request.into_inner();
        let kind = match ProcessSpawnType::try_from(req.r#type) {
            Ok(ProcessSpawnType::Cron) => SpawnKind::Cron,
            Ok(ProcessSpawnType::Fs) => SpawnKind::Fs,
            Ok(ProcessSpawnType::Script) => SpawnKind::Script,
            Err(_) => return Err(Status::invalid_argument("unknown spawn type")),
        };
        let pid = self
            .state
            .scheduler()
            .spawn(kind, &req.spec, &req.cmd)
            .map_err(|err| Status::invalid_argument(err.to_string()))?;
        Ok(Response::new(ProcessSpawnResponse { pid }))
    }

    async fn file_system_put(
        &self,
        request: Request<FileSystemPutRequest>,
    ) -> Result<Response<FileSystemPutResponse>, Status> {
        let req = request.into_inner();
        tokio::fs::copy(&req.src, &req.dst)
            .await
            .map_err(|err| Status::internal(format!("copy {} -> {}: {err}", req.src, req.dst)))?;
        Ok(Response::new(FileSystemPutResponse {}))
    }

    async fn file_system_get(
        &self,
        request: Request<FileSystemGetRequest>,
    ) -> Result<Response<FileSystemGetResponse>, Status> {
        let req = request.into_inner();
        let data = tokio::fs::read(&req.src)
            .await
            .map_err(|err| Status::not_found(format!("read {}: {err}", req.src)))?;
        Ok(Response::new(FileSystemGetResponse { data }))
    }
}
