//! The peer-client abstraction: one capability set, three transports.
//!
//! `DirectClient` talks plain RPC to a known address. `DeliveryClient`
//! publishes calls onto the daemon's outbound event queue to be carried by
//! whichever tunnel is currently open. `ProxyClient` represents a peer that
//! reached *us* through a tunnel, so its calls go down that tunnel's send
//! path. Callers pick a variant at registration time and then never care
//! which one they hold.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};

use crate::config::{DEFAULT_CALL_DEADLINE, RELAY_CALL_DEADLINE};
use crate::error::{FleetError, Result};
use crate::net::frame::{MethodCall, RelayFrame};
use crate::net::tunnel::{LocalDispatcher, Tunnel};
use crate::promise::{Promise, PromiseEvent};
use crate::proto::fleet_daemon_client::FleetDaemonClient;
use crate::proto::{
    CallRequest, DialRequest, FileSystemGetRequest, FileSystemPutRequest, InfoRequest,
    MarkRequest, NodeInfo, PingRequest, ProcessFindRequest, ProcessKillRequest,
    ProcessListRequest, ProcessSpawnRequest, ProcessSpawnType, SignalClearRequest,
    SignalInfoRequest, SignalListRequest, SignalNotifyRequest, SignalWaitRequest, TunnelFrame,
};
use crate::scheduler::{ProcessInfo, ProcessState, SpawnKind};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
/// Deadline for delivery-relayed calls; generous because the answer makes a
/// full round trip over someone else's tunnel.
const DELIVERY_DEADLINE: Duration = Duration::from_secs(10);

/// Capability set shared by all three client variants.
#[tonic::async_trait]
pub trait PeerClient: Send + Sync {
    fn name(&self) -> &str;
    fn is_public(&self) -> bool;
    fn status(&self) -> String;
    async fn close(&self) {}

    async fn ping(&self) -> Result<()>;
    async fn info(&self) -> Result<String>;
    async fn mark(&self, name: &str, addr: &str) -> Result<()>;
    async fn dial(&self, from: &NodeInfo, to: &NodeInfo) -> Result<()>;
    async fn call(&self, node: &str, method: &str, args: &[String]) -> Result<String>;

    /// Open a long-lived tunnel announcing ourselves as `name`, feeding
    /// outbound calls from `events` and answering inbound calls through
    /// `dispatcher`. Only meaningful on a direct client.
    async fn make_tunnel(
        &self,
        name: &str,
        shutdown: CancellationToken,
        promise: Arc<Promise>,
        events: mpsc::Receiver<PromiseEvent>,
        dispatcher: Arc<dyn LocalDispatcher>,
    ) -> Result<()>;

    async fn signal_wait(&self, sig: &str) -> Result<bool>;
    async fn signal_notify(&self, sig: &str) -> Result<()>;
    async fn signal_info(&self, sig: &str) -> Result<(bool, bool)>;
    async fn signal_list(&self) -> Result<Vec<String>>;
    async fn signal_clear(&self, sigs: &[String]) -> Result<()>;

    async fn process_list(&self) -> Result<Vec<ProcessInfo>>;
    async fn process_kill(&self, pid: i64) -> Result<()>;
    async fn process_find(&self, pid: i64, cmd: &str) -> Result<Vec<ProcessInfo>>;
    async fn process_spawn(&self, kind: SpawnKind, spec: &str, cmd: &str) -> Result<i64>;

    async fn fs_put(&self, src: &str, dst: &str) -> Result<()>;
    async fn fs_get(&self, src: &str, dst: &str) -> Result<()>;
}

/// Await `fut` under a bounded deadline, mapping a timeout to the normal
/// deadline-exceeded error.
async fn with_deadline<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = std::result::Result<tonic::Response<T>, tonic::Status>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(Ok(resp)) => Ok(resp.into_inner()),
        Ok(Err(status)) => Err(status.into()),
        Err(_) => Err(FleetError::DeadlineExceeded),
    }
}

fn spawn_kind_to_proto(kind: SpawnKind) -> ProcessSpawnType {
    match kind {
        SpawnKind::Cron => ProcessSpawnType::Cron,
        SpawnKind::Fs => ProcessSpawnType::Fs,
        SpawnKind::Script => ProcessSpawnType::Script,
    }
}

fn proto_process_to_info(p: crate::proto::Process) -> ProcessInfo {
    let state = match p.state.as_str() {
        "new" => ProcessState::New,
        "ready" => ProcessState::Ready,
        "running" => ProcessState::Running,
        "suspended" => ProcessState::Suspended,
        "wait" => ProcessState::Wait,
        _ => ProcessState::Stopped,
    };
    ProcessInfo {
        pid: p.pid,
        state,
        spec: p.spec,
        cmd: p.cmd,
    }
}

// ---------------------------------------------------------------------------
// Direct
// ---------------------------------------------------------------------------

/// Plain RPC over a known `{ip, port}`, with HTTP/2 keep-alive so dead peers
/// surface proactively instead of on the next call.
pub struct DirectClient {
    name: String,
    addr: String,
    client: FleetDaemonClient<Channel>,
}

impl DirectClient {
    /// Build a lazily-connecting client; the first call dials.
    pub fn connect(name: impl Into<String>, addr: impl Into<String>) -> Result<Self> {
        let addr = addr.into();
        let endpoint = Endpoint::from_shared(format!("http://{addr}"))?
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_INTERVAL)
            .keep_alive_while_idle(true);
        let channel = endpoint.connect_lazy();
        Ok(Self {
            name: name.into(),
            addr,
            client: FleetDaemonClient::new(channel),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    fn client(&self) -> FleetDaemonClient<Channel> {
        self.client.clone()
    }
}

#[tonic::async_trait]
impl PeerClient for DirectClient {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_public(&self) -> bool {
        true
    }

    fn status(&self) -> String {
        format!("direct {}", self.addr)
    }

    async fn ping(&self) -> Result<()> {
        let mut cli = self.client();
        with_deadline(DEFAULT_CALL_DEADLINE, cli.ping(PingRequest {})).await?;
        Ok(())
    }

    async fn info(&self) -> Result<String> {
        // Long deadline: the answer may itself traverse a tunnel.
        let mut cli = self.client();
        let res = with_deadline(RELAY_CALL_DEADLINE, cli.info(InfoRequest {})).await?;
        Ok(res.name)
    }

    async fn mark(&self, name: &str, addr: &str) -> Result<()> {
        let mut cli = self.client();
        with_deadline(
            DEFAULT_CALL_DEADLINE,
            cli.mark(MarkRequest {
                name: name.to_string(),
                addr: addr.to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn dial(&self, from: &NodeInfo, to: &NodeInfo) -> Result<()> {
        let mut cli = self.client();
        with_deadline(
            RELAY_CALL_DEADLINE,
            cli.dial(DialRequest {
                from: Some(from.clone()),
                to: Some(to.clone()),
            }),
        )
        .await?;
        Ok(())
    }

    async fn call(&self, node: &str, method: &str, args: &[String]) -> Result<String> {
        let mut cli = self.client();
        let res = with_deadline(
            RELAY_CALL_DEADLINE,
            cli.call(CallRequest {
                node: node.to_string(),
                method: method.to_string(),
                args: args.to_vec(),
            }),
        )
        .await?;
        Ok(res.ret)
    }

    async fn make_tunnel(
        &self,
        name: &str,
        shutdown: CancellationToken,
        promise: Arc<Promise>,
        events: mpsc::Receiver<PromiseEvent>,
        dispatcher: Arc<dyn LocalDispatcher>,
    ) -> Result<()> {
        tracing::info!(relay = %self.addr, name, "try to make tunnel");
        let tunnel = Tunnel::new(name, self.client(), promise, dispatcher);
        tunnel.run(events, shutdown).await
    }

    async fn signal_wait(&self, sig: &str) -> Result<bool> {
        let mut cli = self.client();
        let res = with_deadline(
            DEFAULT_CALL_DEADLINE,
            cli.signal_wait(SignalWaitRequest {
                sig: sig.to_string(),
            }),
        )
        .await?;
        Ok(res.ok)
    }

    async fn signal_notify(&self, sig: &str) -> Result<()> {
        let mut cli = self.client();
        with_deadline(
            DEFAULT_CALL_DEADLINE,
            cli.signal_notify(SignalNotifyRequest {
                sig: sig.to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn signal_info(&self, sig: &str) -> Result<(bool, bool)> {
        let mut cli = self.client();
        let res = with_deadline(
            DEFAULT_CALL_DEADLINE,
            cli.signal_info(SignalInfoRequest {
                sig: sig.to_string(),
            }),
        )
        .await?;
        Ok((res.status, res.exist))
    }

    async fn signal_list(&self) -> Result<Vec<String>> {
        let mut cli = self.client();
        let res = with_deadline(DEFAULT_CALL_DEADLINE, cli.signal_list(SignalListRequest {}))
            .await?;
        Ok(res.sigs)
    }

    async fn signal_clear(&self, sigs: &[String]) -> Result<()> {
        let mut cli = self.client();
        with_deadline(
            DEFAULT_CALL_DEADLINE,
            cli.signal_clear(SignalClearRequest {
                sigs: sigs.to_vec(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn process_list(&self) -> Result<Vec<ProcessInfo>> {
        let mut cli = self.client();
        let res = with_deadline(
            DEFAULT_CALL_DEADLINE,
            cli.process_list(ProcessListRequest {}),
        )
        .await?;
        Ok(res.res.into_iter().map(proto_process_to_info).collect())
    }

    async fn process_kill(&self, pid: i64) -> Result<()> {
        let mut cli = self.client();
        with_deadline(
            DEFAULT_CALL_DEADLINE,
            cli.process_kill(ProcessKillRequest { pid }),
        )
        .await?;
        Ok(())
    }

    async fn process_find(&self, pid: i64, cmd: &str) -> Result<Vec<ProcessInfo>> {
        let mut cli = self.client();
        let res = with_deadline(
            DEFAULT_CALL_DEADLINE,
            cli.process_find(ProcessFindRequest {
                pid,
                cmd: cmd.to_string(),
            }),
        )
        .await?;
        Ok(res.res.into_iter().map(proto_process_to_info).collect())
    }

    async fn process_spawn(&self, kind: SpawnKind, spec: &str, cmd: &str) -> Result<i64> {
        let mut cli = self.client();
        let res = with_deadline(
            DEFAULT_CALL_DEADLINE,
            cli.process_spawn(ProcessSpawnRequest {
                r#type: spawn_kind_to_proto(kind) as i32,
                spec: spec.to_string(),
                cmd: cmd.to_string(),
            }),
        )
        .await?;
        Ok(res.pid)
    }

    async fn fs_put(&self, src: &str, dst: &str) -> Result<()> {
        let mut cli = self.client();
        with_deadline(
            DEFAULT_CALL_DEADLINE,
            cli.file_system_put(FileSystemPutRequest {
                src: src.to_string(),
                dst: dst.to_string(),
            }),
        )
        .await?;
        Ok(())
    }

    async fn fs_get(&self, src: &str, dst: &str) -> Result<()> {
        let mut cli = self.client();
        let res = with_deadline(
            DEFAULT_CALL_DEADLINE,
            cli.file_system_get(FileSystemGetRequest {
                src: src.to_string(),
                dst: dst.to_string(),
            }),
        )
        .await?;
        tokio::fs::write(dst, res.data).await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Delivery
// ---------------------------------------------------------------------------

/// Represents a peer with no direct path: every call is published onto the
/// daemon's outbound event queue, to be serialized by whichever direct
/// client currently holds an open tunnel, and awaited on the correlation
/// table. A miss within the deadline is a deadline-exceeded error; no retry
/// happens at this layer.
pub struct DeliveryClient {
    node: String,
    promise: Arc<Promise>,
    events: mpsc::Sender<PromiseEvent>,
}

impl DeliveryClient {
    pub fn new(
        node: impl Into<String>,
        promise: Arc<Promise>,
        events: mpsc::Sender<PromiseEvent>,
    ) -> Self {
        Self {
            node: node.into(),
            promise,
            events,
        }
    }

    async fn invoke(&self, method: String, limit: Duration) -> Result<String> {
        let id = self.promise.next_id();
        let event = PromiseEvent::new(
            id,
            RelayFrame::MethodCall(MethodCall::new(&self.node, method)),
        );
        // The queue backs up when no tunnel is draining it; the deadline
        // covers the enqueue as well so a call never blocks indefinitely.
        let started = tokio::time::Instant::now();
        match tokio::time::timeout(limit, self.events.send(event)).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(FleetError::TunnelNotEstablished(self.node.clone())),
            Err(_) => return Err(FleetError::DeadlineExceeded),
        }
        let remaining = limit.saturating_sub(started.elapsed());
        self.promise
            .load_with_timeout(id, remaining)
            .await
            .ok_or(FleetError::DeadlineExceeded)
    }
}

#[tonic::async_trait]
impl PeerClient for DeliveryClient {
    fn name(&self) -> &str {
        &self.node
    }

    fn is_public(&self) -> bool {
        false
    }

    fn status(&self) -> String {
        format!("delivery -> {}", self.node)
    }

    async fn ping(&self) -> Result<()> {
        self.invoke("ping".to_string(), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(())
    }

    async fn info(&self) -> Result<String> {
        self.invoke("info".to_string(), DELIVERY_DEADLINE).await
    }

    async fn mark(&self, name: &str, addr: &str) -> Result<()> {
        self.invoke(format!("mark {name} {addr}"), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(())
    }

    async fn dial(&self, _from: &NodeInfo, _to: &NodeInfo) -> Result<()> {
        Err(FleetError::Internal(
            "dial is not supported over a relayed client".into(),
        ))
    }

    async fn call(&self, _node: &str, _method: &str, _args: &[String]) -> Result<String> {
        Err(FleetError::Internal(
            "nested call is not supported over a relayed client".into(),
        ))
    }

    async fn make_tunnel(
        &self,
        _name: &str,
        _shutdown: CancellationToken,
        _promise: Arc<Promise>,
        _events: mpsc::Receiver<PromiseEvent>,
        _dispatcher: Arc<dyn LocalDispatcher>,
    ) -> Result<()> {
        Err(FleetError::Internal(
            "a relayed client cannot open a tunnel".into(),
        ))
    }

    async fn signal_wait(&self, sig: &str) -> Result<bool> {
        let v = self
            .invoke(format!("signalwait {sig}"), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(v == "true")
    }

    async fn signal_notify(&self, sig: &str) -> Result<()> {
        self.invoke(format!("signalnotify {sig}"), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(())
    }

    async fn signal_info(&self, sig: &str) -> Result<(bool, bool)> {
        let v = self
            .invoke(format!("signalinfo {sig}"), DEFAULT_CALL_DEADLINE)
            .await?;
        let res: Vec<bool> = serde_json::from_str(&v)?;
        Ok((
            res.first().copied().unwrap_or(false),
            res.get(1).copied().unwrap_or(false),
        ))
    }

    async fn signal_list(&self) -> Result<Vec<String>> {
        let v = self
            .invoke("signallist".to_string(), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(serde_json::from_str(&v)?)
    }

    async fn signal_clear(&self, sigs: &[String]) -> Result<()> {
        self.invoke(
            format!("signalclear {}", sigs.join(" ")),
            DEFAULT_CALL_DEADLINE,
        )
        .await?;
        Ok(())
    }

    async fn process_list(&self) -> Result<Vec<ProcessInfo>> {
        let v = self
            .invoke("processlist".to_string(), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(serde_json::from_str(&v)?)
    }

    async fn process_kill(&self, pid: i64) -> Result<()> {
        self.invoke(format!("processkill {pid}"), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(())
    }

    async fn process_find(&self, pid: i64, cmd: &str) -> Result<Vec<ProcessInfo>> {
        let v = self
            .invoke(format!("processfind {pid} {cmd}"), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(serde_json::from_str(&v)?)
    }

    async fn process_spawn(&self, kind: SpawnKind, spec: &str, cmd: &str) -> Result<i64> {
        let args = serde_json::to_string(&[kind.to_string(), spec.to_string(), cmd.to_string()])?;
        let v = self
            .invoke(format!("processspawn {args}"), DEFAULT_CALL_DEADLINE)
            .await?;
        v.parse()
            .map_err(|_| FleetError::Internal(format!("bad pid in answer: {v}")))
    }

    async fn fs_put(&self, _src: &str, _dst: &str) -> Result<()> {
        Err(FleetError::Internal(
            "file transfer is not supported over a relayed client".into(),
        ))
    }

    async fn fs_get(&self, _src: &str, _dst: &str) -> Result<()> {
        Err(FleetError::Internal(
            "file transfer is not supported over a relayed client".into(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn delivery_enqueue_is_bounded_by_the_deadline() {
        let promise = Arc::new(Promise::new(1));
        let (tx, _rx) = mpsc::channel(1);
        // Fill the queue so the next send would park forever.
        tx.send(PromiseEvent::new(
            1,
            RelayFrame::MethodCall(MethodCall::new("worker", "ping".to_string())),
        ))
        .await
        .unwrap();

        let client = DeliveryClient::new("worker", promise, tx);
        let err = client
            .invoke("ping".to_string(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn delivery_send_on_closed_queue_reports_no_tunnel() {
        let promise = Arc::new(Promise::new(1));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let client = DeliveryClient::new("worker", promise, tx);
        let err = client
            .invoke("ping".to_string(), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, FleetError::TunnelNotEstablished(_)));
    }
}

// ---------------------------------------------------------------------------
// Proxy
// ---------------------------------------------------------------------------

/// Represents a peer that reached us by opening a tunnel. Calls are written
/// straight onto that tunnel's send path; a reconnecting `Establish`
/// re-binds the sender without touching the registry entry.
pub struct ProxyClient {
    node: String,
    addr: RwLock<String>,
    promise: Arc<Promise>,
    outbound: RwLock<Option<mpsc::Sender<TunnelFrame>>>,
}

impl ProxyClient {
    pub fn new(node: impl Into<String>, addr: impl Into<String>, promise: Arc<Promise>) -> Self {
        Self {
            node: node.into(),
            addr: RwLock::new(addr.into()),
            promise,
            outbound: RwLock::new(None),
        }
    }

    /// Bind (or re-bind) the tunnel send path after an `Establish`.
    pub fn bind(&self, sender: mpsc::Sender<TunnelFrame>) {
        *self.outbound.write().expect("proxy lock poisoned") = Some(sender);
    }

    pub fn set_addr(&self, addr: impl Into<String>) {
        *self.addr.write().expect("proxy lock poisoned") = addr.into();
    }

    fn sender(&self) -> Result<mpsc::Sender<TunnelFrame>> {
        self.outbound
            .read()
            .expect("proxy lock poisoned")
            .clone()
            .ok_or_else(|| FleetError::TunnelNotEstablished(self.node.clone()))
    }

    async fn invoke(&self, method: String, limit: Duration) -> Result<String> {
        let sender = self.sender()?;
        let id = self.promise.next_id();
        let frame =
            RelayFrame::MethodCall(MethodCall::new(&self.node, method)).into_tunnel_frame(id);
        sender
            .send(frame)
            .await
            .map_err(|_| FleetError::TunnelNotEstablished(self.node.clone()))?;
        self.promise
            .load_with_timeout(id, limit)
            .await
            .ok_or(FleetError::DeadlineExceeded)
    }
}

#[tonic::async_trait]
impl PeerClient for ProxyClient {
    fn name(&self) -> &str {
        &self.node
    }

    fn is_public(&self) -> bool {
        false
    }

    fn status(&self) -> String {
        let bound = self
            .outbound
            .read()
            .expect("proxy lock poisoned")
            .is_some();
        let addr = self.addr.read().expect("proxy lock poisoned").clone();
        format!(
            "proxy {} ({})",
            addr,
            if bound { "bound" } else { "unbound" }
        )
    }

    async fn ping(&self) -> Result<()> {
        self.invoke("ping".to_string(), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(())
    }

    async fn info(&self) -> Result<String> {
        self.invoke("info".to_string(), DELIVERY_DEADLINE).await
    }

    async fn mark(&self, name: &str, addr: &str) -> Result<()> {
        self.invoke(format!("mark {name} {addr}"), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(())
    }

    async fn dial(&self, _from: &NodeInfo, _to: &NodeInfo) -> Result<()> {
        Err(FleetError::Internal(
            "dial is not supported over a relayed client".into(),
        ))
    }

    async fn call(&self, _node: &str, _method: &str, _args: &[String]) -> Result<String> {
        Err(FleetError::Internal(
            "nested call is not supported over a relayed client".into(),
        ))
    }

    async fn make_tunnel(
        &self,
        _name: &str,
        _shutdown: CancellationToken,
        _promise: Arc<Promise>,
        _events: mpsc::Receiver<PromiseEvent>,
        _dispatcher: Arc<dyn LocalDispatcher>,
    ) -> Result<()> {
        Err(FleetError::Internal(
            "a relayed client cannot open a tunnel".into(),
        ))
    }

    async fn signal_wait(&self, sig: &str) -> Result<bool> {
        let v = self
            .invoke(format!("signalwait {sig}"), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(v == "true")
    }

    async fn signal_notify(&self, sig: &str) -> Result<()> {
        self.invoke(format!("signalnotify {sig}"), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(())
    }

    async fn signal_info(&self, sig: &str) -> Result<(bool, bool)> {
        let v = self
            .invoke(format!("signalinfo {sig}"), DEFAULT_CALL_DEADLINE)
            .await?;
        let res: Vec<bool> = serde_json::from_str(&v)?;
        Ok((
            res.first().copied().unwrap_or(false),
            res.get(1).copied().unwrap_or(false),
        ))
    }

    async fn signal_list(&self) -> Result<Vec<String>> {
        let v = self
            .invoke("signallist".to_string(), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(serde_json::from_str(&v)?)
    }

    async fn signal_clear(&self, sigs: &[String]) -> Result<()> {
        self.invoke(
            format!("signalclear {}", sigs.join(" ")),
            DEFAULT_CALL_DEADLINE,
        )
        .await?;
        Ok(())
    }

    async fn process_list(&self) -> Result<Vec<ProcessInfo>> {
        let v = self
            .invoke("processlist".to_string(), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(serde_json::from_str(&v)?)
    }

    async fn process_kill(&self, pid: i64) -> Result<()> {
        self.invoke(format!("processkill {pid}"), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(())
    }

    async fn process_find(&self, pid: i64, cmd: &str) -> Result<Vec<ProcessInfo>> {
        let v = self
            .invoke(format!("processfind {pid} {cmd}"), DEFAULT_CALL_DEADLINE)
            .await?;
        Ok(serde_json::from_str(&v)?)
    }

    async fn process_spawn(&self, kind: SpawnKind, spec: &str, cmd: &str) -> Result<i64> {
        let args = serde_json::to_string(&[kind.to_string(), spec.to_string(), cmd.to_string()])?;
        let v = self
            .invoke(format!("processspawn {args}"), DEFAULT_CALL_DEADLINE)
            .await?;
        v.parse()
            .map_err(|_| FleetError::Internal(format!("bad pid in answer: {v}")))
    }

    async fn fs_put(&self, _src: &str, _dst: &str) -> Result<()> {
        Err(FleetError::Internal(
            "file transfer is not supported over a relayed client".into(),
        ))
    }

    async fn fs_get(&self, _src: &str, _dst: &str) -> Result<()> {
        Err(FleetError::Internal(
            "file transfer is not supported over a relayed client".into(),
        ))
    }
}
