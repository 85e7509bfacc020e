//! VR tracking-device protocol server
//!
//! Accepts TCP clients through the event dispatcher, runs the per-connection
//! protocol state machine, and pushes incremental state updates to every
//! streaming client. The whole server is a consumer of the dispatcher
//! contract: accept is one I/O listener, each client socket is another, and
//! the push half runs between dispatch iterations. There is no server
//! thread of its own.
//!
//! # Client state machine
//!
//! ```text
//!           CONNECT            ACTIVATE             STARTSTREAM
//!   START ----------> CONNECTED <---------> ACTIVE <-----------> STREAMING
//!                         |      DEACTIVATE    |     STOPSTREAM      |
//!                         | DISCONNECT         +-- POWEROFF ---------+
//!                         v                    +-- HAPTICTICK -------+
//!                      (closed)                   (no state change)
//! ```
//!
//! A message outside this table, or any I/O failure on a client socket,
//! disconnects that one client and nobody else.
//!
//! # Push updates
//!
//! The device manager fires a notification callback whenever the tracker
//! packet, a battery state, or an HMD configuration changes; the callback
//! bumps the topic's version counter and interrupts the dispatcher. After
//! every dispatch iteration the server compares those counters against its
//! streamed mirrors, serializes each changed topic once under the manager's
//! lock, and writes the update to every streaming client whose negotiated
//! version supports the topic. Only then does the mirror advance, so a
//! change racing the serialization is sent again on the next pass rather
//! than lost.

mod client;

use crate::devices::manager::DeviceManager;
use crate::dispatch::{DispatcherHandle, EventDispatcher, IoEvents, ListenerKey};
use crate::error::{Error, Result};
use crate::protocol::wire::WireReader;
use crate::protocol::{
    messages, MessageId, MIN_VERSION_BATTERY_STATE, MIN_VERSION_HMD_CONFIGURATION,
    PROTOCOL_VERSION,
};
use self::client::{ClientState, ProtocolState};
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Per-topic change counters, bumped by the device manager's notification
/// callbacks from whatever thread the driver publishes on. Slot counts are
/// fixed at construction; only the values move.
struct TopicVersions {
    tracker: AtomicU32,
    batteries: Vec<AtomicU32>,
    hmds: Vec<AtomicU32>,
}

impl TopicVersions {
    fn new(devices: usize, hmds: usize) -> Self {
        Self {
            tracker: AtomicU32::new(0),
            batteries: (0..devices).map(|_| AtomicU32::new(0)).collect(),
            hmds: (0..hmds).map(|_| AtomicU32::new(0)).collect(),
        }
    }
}

/// What has actually been written to the streaming clients. Touched only on
/// the dispatch thread; a topic is due exactly while its mirror differs
/// from the manager-side counter.
struct StreamedVersions {
    tracker: u32,
    batteries: Vec<u32>,
    hmds: Vec<u32>,
}

impl StreamedVersions {
    fn new(devices: usize, hmds: usize) -> Self {
        Self {
            tracker: 0,
            batteries: vec![0; devices],
            hmds: vec![0; hmds],
        }
    }
}

/// Dispatch context for the server's event loop: the client table, the
/// active/streaming counts, and the push-side version bookkeeping. Every
/// dispatcher callback receives it mutably; nothing else touches it.
pub struct ServerContext {
    listener: TcpListener,
    handle: DispatcherHandle<ServerContext>,
    manager: Arc<DeviceManager>,
    clients: HashMap<ListenerKey, ClientState>,
    /// Clients in ACTIVE or STREAMING; drives manager start/stop
    active_clients: usize,
    streaming_clients: usize,
    versions: Arc<TopicVersions>,
    streamed: StreamedVersions,
}

impl ServerContext {
    // === Accept path ===

    /// Accept every pending connection. Readiness is edge-triggered, so
    /// this runs until the listener would block.
    fn accept_clients(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(err) = stream.set_nonblocking(true) {
                        log::warn!("Rejecting client {}: {}", peer, err);
                        continue;
                    }
                    // Push latency matters more than packing for a tracker
                    // feed; updates are a few hundred bytes at most.
                    let _ = stream.set_nodelay(true);
                    let fd = stream.as_raw_fd();
                    let registered = self.handle.add_io_listener(
                        fd,
                        IoEvents::READ,
                        Box::new(|ctx: &mut ServerContext, key, _fd, _events| {
                            ctx.handle_client_ready(key)
                        }),
                    );
                    match registered {
                        Ok(key) => {
                            log::info!("Client connected from {}", peer);
                            self.clients.insert(key, ClientState::new(stream, peer));
                        }
                        Err(err) => {
                            log::error!("Registering client {} failed: {}", peer, err);
                            return;
                        }
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    // A failed accept leaves the listener usable; keep serving
                    // the clients that are already here.
                    log::error!("Accept failed: {}", err);
                    return;
                }
            }
        }
    }

    // === Per-client request path ===

    /// I/O callback body for one client socket. The return value is the
    /// dispatcher's "remove this listener" flag.
    fn handle_client_ready(&mut self, key: ListenerKey) -> bool {
        // Taken out of the table while being serviced so the handlers can
        // borrow the rest of the context freely.
        let Some(mut client) = self.clients.remove(&key) else {
            // Dropped by a broadcast failure before its removal was applied.
            return true;
        };
        match self.service_client(&mut client) {
            Ok(true) => {
                self.clients.insert(key, client);
                return false;
            }
            Ok(false) => {
                log::info!("Client {} disconnected", client.peer);
            }
            Err(Error::Io(ref err)) if err.kind() == io::ErrorKind::UnexpectedEof => {
                log::info!("Client {} closed the connection", client.peer);
            }
            Err(err) => {
                log::warn!("Dropping client {}: {}", client.peer, err);
            }
        }
        self.note_disconnect(&client);
        let _ = client.stream.shutdown(Shutdown::Both);
        true
    }

    /// Drain the socket and act on every complete request. `Ok(false)` is a
    /// clean client-requested disconnect; errors are per-client failures
    /// that the caller converts into a disconnect.
    fn service_client(&mut self, client: &mut ClientState) -> Result<bool> {
        let open = client.fill()?;
        while let Some((id, body)) = client.next_message()? {
            if !self.handle_message(client, id, &body)? {
                return Ok(false);
            }
        }
        if !open {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(true)
    }

    /// One request through the state machine. `Ok(false)` means the client
    /// asked to disconnect.
    fn handle_message(
        &mut self,
        client: &mut ClientState,
        id: MessageId,
        body: &[u8],
    ) -> Result<bool> {
        match (client.state, id) {
            (ProtocolState::Start, MessageId::ConnectRequest) => {
                let requested = WireReader::new(body).u32()?;
                let negotiated = requested.min(PROTOCOL_VERSION);
                log::debug!(
                    "Client {} speaks protocol version {} (requested {})",
                    client.peer,
                    negotiated,
                    requested
                );
                client.version = negotiated;
                client.state = ProtocolState::Connected;
                client.send(&messages::connect_reply(&self.manager, negotiated))?;
            }
            (ProtocolState::Connected, MessageId::ActivateRequest) => {
                if self.active_clients == 0 {
                    self.manager.start()?;
                }
                self.active_clients += 1;
                client.state = ProtocolState::Active;
                log::debug!(
                    "Client {} activated ({} active)",
                    client.peer,
                    self.active_clients
                );
            }
            (ProtocolState::Connected, MessageId::DisconnectRequest) => {
                return Ok(false);
            }
            (ProtocolState::Active, MessageId::PacketRequest) => {
                let message = self.serialize_tracker_packet();
                client.send(&message)?;
            }
            (ProtocolState::Active, MessageId::StartStreamRequest) => {
                // Snapshot first, then push only subsequent changes.
                let message = self.serialize_tracker_packet();
                client.send(&message)?;
                client.state = ProtocolState::Streaming;
                self.streaming_clients += 1;
                log::debug!(
                    "Client {} streaming ({} streaming)",
                    client.peer,
                    self.streaming_clients
                );
            }
            (ProtocolState::Active, MessageId::DeactivateRequest) => {
                client.state = ProtocolState::Connected;
                self.active_clients -= 1;
                if self.active_clients == 0 {
                    self.manager.stop();
                }
                log::debug!(
                    "Client {} deactivated ({} active)",
                    client.peer,
                    self.active_clients
                );
            }
            (ProtocolState::Streaming, MessageId::StopStreamRequest) => {
                client.state = ProtocolState::Active;
                self.streaming_clients -= 1;
                // Written after any pushed packet, so receiving it tells the
                // client its stream has fully drained.
                client.send(&messages::stop_stream_reply())?;
            }
            (ProtocolState::Streaming, MessageId::PacketRequest) => {
                // The stream is already delivering packets; nothing extra.
            }
            (ProtocolState::Active | ProtocolState::Streaming, MessageId::PowerOffRequest) => {
                let feature = WireReader::new(body).u16()?;
                self.manager.power_off(feature as usize)?;
            }
            (ProtocolState::Active | ProtocolState::Streaming, MessageId::HapticTickRequest) => {
                let mut reader = WireReader::new(body);
                let feature = reader.u16()?;
                let duration_ms = reader.u16()?;
                self.manager.haptic_tick(feature as usize, duration_ms)?;
            }
            (state, id) => {
                return Err(Error::Protocol(format!(
                    "{id:?} is not valid in client state {state:?}"
                )));
            }
        }
        Ok(true)
    }

    // === Push path ===

    /// Send every topic whose manager-side version has moved past its
    /// streamed mirror. Runs after each dispatch iteration.
    fn broadcast_pending(&mut self) {
        let tracker_version = self.versions.tracker.load(Ordering::SeqCst);
        if self.streamed.tracker != tracker_version {
            if self.streaming_clients > 0 {
                let message = self.serialize_tracker_packet();
                // Tracker packets go to every streaming client; the layout
                // was fixed in the handshake for all protocol versions.
                self.send_to_streaming(0, &message);
            }
            self.streamed.tracker = tracker_version;
        }

        for device in 0..self.streamed.batteries.len() {
            let manager_version = self.versions.batteries[device].load(Ordering::SeqCst);
            if self.streamed.batteries[device] == manager_version {
                continue;
            }
            if self.streaming_clients > 0 {
                let message = {
                    let states = self.manager.battery_states();
                    match states.get(device) {
                        Some(state) => messages::battery_state_update(device as u16, state),
                        None => continue,
                    }
                };
                self.send_to_streaming(MIN_VERSION_BATTERY_STATE, &message);
            }
            self.streamed.batteries[device] = manager_version;
        }

        for hmd in 0..self.streamed.hmds.len() {
            let manager_version = self.versions.hmds[hmd].load(Ordering::SeqCst);
            if self.streamed.hmds[hmd] == manager_version {
                continue;
            }
            if self.streaming_clients > 0 {
                let message = {
                    let configurations = self.manager.hmd_configurations();
                    match configurations.get(hmd) {
                        Some(configuration) => messages::hmd_config_update(configuration),
                        None => continue,
                    }
                };
                self.send_to_streaming(MIN_VERSION_HMD_CONFIGURATION, &message);
            }
            self.streamed.hmds[hmd] = manager_version;
        }
    }

    /// One serialized update to every streaming client whose negotiated
    /// version is at least `min_version`. A failed write drops that client
    /// and that client only; delivery to the rest continues.
    fn send_to_streaming(&mut self, min_version: u32, message: &[u8]) {
        let mut failed = Vec::new();
        for (&key, client) in self.clients.iter_mut() {
            if !client.is_streaming() || !client.supports(min_version) {
                continue;
            }
            if let Err(err) = client.send(message) {
                log::warn!("Dropping client {}: {}", client.peer, err);
                failed.push(key);
            }
        }
        for key in failed {
            self.drop_client(key);
        }
    }

    /// Remove a client from outside its own I/O callback. The listener
    /// removal is queued; until it applies, a late readiness event finds no
    /// table entry and unregisters itself.
    fn drop_client(&mut self, key: ListenerKey) {
        let Some(client) = self.clients.remove(&key) else {
            return;
        };
        self.note_disconnect(&client);
        let _ = client.stream.shutdown(Shutdown::Both);
        if let Err(err) = self.handle.remove_io_listener(key) {
            log::debug!("Listener removal for {} not delivered: {}", client.peer, err);
        }
    }

    /// Fix the active/streaming counts for a departing client, stopping the
    /// device manager when the last active client goes away.
    fn note_disconnect(&mut self, client: &ClientState) {
        if client.is_streaming() {
            self.streaming_clients -= 1;
        }
        if client.is_active() {
            self.active_clients -= 1;
            if self.active_clients == 0 {
                self.manager.stop();
            }
        }
    }

    fn serialize_tracker_packet(&self) -> Vec<u8> {
        let packet = self.manager.tracker_state();
        messages::packet_reply(&packet)
    }

    /// Shutdown path: close every remaining connection and release the
    /// device manager if any client was still active.
    fn close_all_clients(&mut self) {
        if !self.clients.is_empty() {
            log::info!("Closing {} client connection(s)", self.clients.len());
        }
        for (_, client) in self.clients.drain() {
            let _ = client.stream.shutdown(Shutdown::Both);
        }
        self.streaming_clients = 0;
        if self.active_clients > 0 {
            self.active_clients = 0;
            self.manager.stop();
        }
    }
}

/// The tracking-device server: one listening socket, one event dispatcher,
/// and the client table behind it.
pub struct VrDeviceServer {
    dispatcher: EventDispatcher<ServerContext>,
    context: ServerContext,
    local_addr: SocketAddr,
}

impl VrDeviceServer {
    /// Bind the listening socket and wire the device manager's change
    /// notifications to the dispatcher. The server does not serve until
    /// [`run`](Self::run) is called.
    pub fn bind(bind_address: &str, manager: Arc<DeviceManager>) -> Result<Self> {
        let listener = TcpListener::bind(bind_address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let dispatcher = EventDispatcher::new()?;
        let handle = dispatcher.handle();

        let devices = manager.battery_states().len();
        let hmds = manager.hmd_configurations().len();
        let versions = Arc::new(TopicVersions::new(devices, hmds));
        register_change_notifications(&manager, &versions, &handle);

        dispatcher.add_io_listener(
            listener.as_raw_fd(),
            IoEvents::READ,
            Box::new(|ctx: &mut ServerContext, _key, _fd, _events| {
                ctx.accept_clients();
                false
            }),
        )?;

        log::info!(
            "Device server listening on {} (protocol version {})",
            local_addr,
            PROTOCOL_VERSION
        );

        Ok(Self {
            dispatcher,
            context: ServerContext {
                listener,
                handle,
                manager,
                clients: HashMap::new(),
                active_clients: 0,
                streaming_clients: 0,
                versions,
                streamed: StreamedVersions::new(devices, hmds),
            },
            local_addr,
        })
    }

    /// Address the listener actually bound, useful with a `:0` port.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Cross-thread handle to the server's dispatcher, e.g. for a signal
    /// handler to request [`stop`](DispatcherHandle::stop).
    pub fn handle(&self) -> DispatcherHandle<ServerContext> {
        self.dispatcher.handle()
    }

    /// Serve until a stop request arrives. Per-client failures are absorbed
    /// inside the loop; only dispatcher-level failures return an error.
    /// Either way every connection is closed and the device manager is
    /// released before this returns.
    pub fn run(&mut self) -> Result<()> {
        let result = loop {
            match self.dispatcher.dispatch_next_event(&mut self.context) {
                Ok(true) => self.context.broadcast_pending(),
                Ok(false) => break Ok(()),
                Err(err) => break Err(err),
            }
        };
        self.context.close_all_clients();
        if result.is_ok() {
            log::info!("Device server stopped");
        }
        result
    }
}

/// Hook the three topic notifications up to version bumps plus a dispatcher
/// interrupt. The callbacks run on driver threads; the interrupt is the only
/// thing they may do to the dispatch thread.
fn register_change_notifications(
    manager: &DeviceManager,
    versions: &Arc<TopicVersions>,
    handle: &DispatcherHandle<ServerContext>,
) {
    let tracker_versions = Arc::clone(versions);
    let tracker_handle = handle.clone();
    manager.notify_tracker_updates(move || {
        tracker_versions.tracker.fetch_add(1, Ordering::SeqCst);
        if tracker_handle.interrupt().is_err() {
            log::debug!("Tracker update after dispatcher shutdown");
        }
    });

    let battery_versions = Arc::clone(versions);
    let battery_handle = handle.clone();
    manager.notify_battery_updates(move |device| {
        if let Some(version) = battery_versions.batteries.get(device) {
            version.fetch_add(1, Ordering::SeqCst);
            if battery_handle.interrupt().is_err() {
                log::debug!("Battery update after dispatcher shutdown");
            }
        }
    });

    let hmd_versions = Arc::clone(versions);
    let hmd_handle = handle.clone();
    manager.notify_hmd_updates(move |hmd| {
        if let Some(version) = hmd_versions.hmds.get(hmd) {
            version.fetch_add(1, Ordering::SeqCst);
            if hmd_handle.interrupt().is_err() {
                log::debug!("HMD update after dispatcher shutdown");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::devices::types::BatteryState;
    use std::io::Read;
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    /// Server on a loopback port with one accepted client, driven directly
    /// through the context instead of the dispatch loop.
    fn server_with_client() -> (VrDeviceServer, ListenerKey, TcpStream) {
        let mut server = test_server();
        let (key, client) = attach_client(&mut server);
        (server, key, client)
    }

    fn test_server() -> VrDeviceServer {
        let mut config = Config::simulator_defaults();
        config.simulation = None;
        let manager = Arc::new(DeviceManager::from_config(&config).unwrap());
        VrDeviceServer::bind("127.0.0.1:0", manager).unwrap()
    }

    fn attach_client(server: &mut VrDeviceServer) -> (ListenerKey, TcpStream) {
        let existing: Vec<ListenerKey> = server.context.clients.keys().copied().collect();
        let client = TcpStream::connect(server.local_addr()).unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        // Like the server side and the integration harness: without
        // TCP_NODELAY, Nagle can hold a small request past `pump`'s window
        // while the previous one is still unacknowledged.
        client.set_nodelay(true).unwrap();
        server.context.accept_clients();
        let key = server
            .context
            .clients
            .keys()
            .copied()
            .find(|key| !existing.contains(key))
            .expect("accept should have registered the connection");
        (key, client)
    }

    /// Let loopback delivery settle, then run the client's I/O callback the
    /// way the dispatcher would. Returns the remove-listener flag.
    fn pump(server: &mut VrDeviceServer, key: ListenerKey) -> bool {
        thread::sleep(Duration::from_millis(20));
        server.context.handle_client_ready(key)
    }

    fn read_exact(client: &mut TcpStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        client.read_exact(&mut buf).unwrap();
        buf
    }

    fn handshake(
        server: &mut VrDeviceServer,
        key: ListenerKey,
        client: &mut TcpStream,
        version: u32,
    ) {
        use std::io::Write;
        client
            .write_all(&messages::connect_request(version))
            .unwrap();
        assert!(!pump(server, key));
        let expected =
            messages::connect_reply(&server.context.manager, version.min(PROTOCOL_VERSION));
        assert_eq!(read_exact(client, expected.len()), expected);
    }

    #[test]
    fn test_handshake_tracks_negotiated_version() {
        let (mut server, key, mut client) = server_with_client();
        handshake(&mut server, key, &mut client, 3);

        let state = &server.context.clients[&key];
        assert_eq!(state.state, ProtocolState::Connected);
        assert_eq!(state.version, 3);
        assert!(state.supports(2));
        assert!(!state.supports(4));
    }

    #[test]
    fn test_double_activate_drops_client_and_stops_manager() {
        use std::io::Write;
        let (mut server, key, mut client) = server_with_client();
        handshake(&mut server, key, &mut client, PROTOCOL_VERSION);

        client
            .write_all(&messages::request(MessageId::ActivateRequest))
            .unwrap();
        assert!(!pump(&mut server, key));
        assert_eq!(server.context.active_clients, 1);
        assert!(server.context.manager.is_running());

        // Already active: a second ACTIVATE is a protocol error.
        client
            .write_all(&messages::request(MessageId::ActivateRequest))
            .unwrap();
        assert!(pump(&mut server, key), "violating client should be removed");
        assert!(server.context.clients.is_empty());
        assert_eq!(server.context.active_clients, 0);
        assert!(!server.context.manager.is_running());
    }

    #[test]
    fn test_manager_runs_while_any_client_is_active() {
        use std::io::Write;
        let mut server = test_server();
        let (key_a, mut client_a) = attach_client(&mut server);
        let (key_b, mut client_b) = attach_client(&mut server);
        handshake(&mut server, key_a, &mut client_a, 6);
        handshake(&mut server, key_b, &mut client_b, 6);

        for (key, client) in [(key_a, &mut client_a), (key_b, &mut client_b)] {
            client
                .write_all(&messages::request(MessageId::ActivateRequest))
                .unwrap();
            assert!(!pump(&mut server, key));
        }
        assert_eq!(server.context.active_clients, 2);
        assert!(server.context.manager.is_running());

        // One deactivates cleanly, the other just vanishes.
        client_a
            .write_all(&messages::request(MessageId::DeactivateRequest))
            .unwrap();
        assert!(!pump(&mut server, key_a));
        assert!(server.context.manager.is_running(), "one client still active");

        drop(client_b);
        assert!(pump(&mut server, key_b), "EOF should remove the client");
        assert_eq!(server.context.active_clients, 0);
        assert!(!server.context.manager.is_running());
    }

    #[test]
    fn test_broadcast_sends_once_per_change() {
        use std::io::Write;
        let (mut server, key, mut client) = server_with_client();
        handshake(&mut server, key, &mut client, PROTOCOL_VERSION);

        let mut requests = messages::request(MessageId::ActivateRequest);
        requests.extend_from_slice(&messages::request(MessageId::StartStreamRequest));
        client.write_all(&requests).unwrap();
        assert!(!pump(&mut server, key));

        // STARTSTREAM answers with a snapshot of the (still default) packet.
        let snapshot = {
            let packet = server.context.manager.tracker_state();
            messages::packet_reply(&packet)
        };
        assert_eq!(read_exact(&mut client, snapshot.len()), snapshot);

        // A battery change reaches the client exactly once.
        let state = BatteryState {
            charging: true,
            percent: 41,
        };
        assert!(server
            .context
            .manager
            .update_sink()
            .publish_battery_state(2, state));
        server.context.broadcast_pending();
        let update = messages::battery_state_update(2, &state);
        assert_eq!(read_exact(&mut client, update.len()), update);

        // No manager-side change: a second pass must send nothing.
        server.context.broadcast_pending();
        client
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        let mut byte = [0u8; 1];
        let silent = match client.read(&mut byte) {
            Err(err) => {
                err.kind() == io::ErrorKind::WouldBlock || err.kind() == io::ErrorKind::TimedOut
            }
            Ok(_) => false,
        };
        assert!(silent, "idempotent pass wrote to the socket");
    }

    #[test]
    fn test_broadcast_skips_clients_below_topic_version() {
        use std::io::Write;
        let (mut server, key, mut client) = server_with_client();
        // Version 3: packets yes, battery updates no.
        handshake(&mut server, key, &mut client, 3);

        let mut requests = messages::request(MessageId::ActivateRequest);
        requests.extend_from_slice(&messages::request(MessageId::StartStreamRequest));
        client.write_all(&requests).unwrap();
        assert!(!pump(&mut server, key));
        let snapshot = {
            let packet = server.context.manager.tracker_state();
            messages::packet_reply(&packet)
        };
        assert_eq!(read_exact(&mut client, snapshot.len()), snapshot);

        let sink = server.context.manager.update_sink();
        sink.publish_battery_state(
            0,
            BatteryState {
                charging: false,
                percent: 12,
            },
        );
        server.context.broadcast_pending();

        // The next bytes this client sees must be a tracker packet, not the
        // battery update it cannot parse.
        sink.publish_tracker_state(|packet| {
            packet.trackers[0].position = [4.0, 5.0, 6.0];
        });
        server.context.broadcast_pending();
        let header = read_exact(&mut client, 2);
        assert_eq!(
            u16::from_le_bytes([header[0], header[1]]),
            MessageId::PacketReply as u16
        );
    }

    #[test]
    fn test_broadcast_failure_drops_only_failed_client() {
        use std::io::Write;
        let mut server = test_server();
        let (key_a, mut client_a) = attach_client(&mut server);
        let (key_b, mut client_b) = attach_client(&mut server);
        handshake(&mut server, key_a, &mut client_a, 6);
        handshake(&mut server, key_b, &mut client_b, 6);

        for (key, client) in [(key_a, &mut client_a), (key_b, &mut client_b)] {
            let mut requests = messages::request(MessageId::ActivateRequest);
            requests.extend_from_slice(&messages::request(MessageId::StartStreamRequest));
            client.write_all(&requests).unwrap();
            assert!(!pump(&mut server, key));
            let snapshot = {
                let packet = server.context.manager.tracker_state();
                messages::packet_reply(&packet)
            };
            assert_eq!(read_exact(client, snapshot.len()), snapshot);
        }
        assert_eq!(server.context.streaming_clients, 2);

        // Kill A's receive side, then push twice: the first write may still
        // land in A's kernel buffer, the second fails and drops A.
        drop(client_a);
        let sink = server.context.manager.update_sink();
        for round in 0..2 {
            sink.publish_tracker_state(|packet| {
                packet.trackers[0].position[0] = round as f32 + 1.0;
            });
            thread::sleep(Duration::from_millis(30));
            server.context.broadcast_pending();
        }

        assert!(!server.context.clients.contains_key(&key_a));
        assert!(server.context.clients.contains_key(&key_b));
        assert_eq!(server.context.streaming_clients, 1);
        assert_eq!(server.context.active_clients, 1);

        // B received both pushes in order.
        for round in 0..2 {
            let expected = {
                let mut packet = server.context.manager.tracker_state().clone();
                packet.trackers[0].position[0] = round as f32 + 1.0;
                messages::packet_reply(&packet)
            };
            let got = read_exact(&mut client_b, expected.len());
            assert_eq!(got[..2], expected[..2]);
            // Position x of tracker 0 sits right after id and timestamp.
            assert_eq!(got[10..14], (round as f32 + 1.0).to_le_bytes());
        }
    }

    #[test]
    fn test_feature_requests_forward_and_bounds_check() {
        use std::io::Write;
        let (mut server, key, mut client) = server_with_client();
        handshake(&mut server, key, &mut client, PROTOCOL_VERSION);
        client
            .write_all(&messages::request(MessageId::ActivateRequest))
            .unwrap();
        assert!(!pump(&mut server, key));

        // In range: accepted without a reply (no driver attached).
        client.write_all(&messages::power_off_request(2)).unwrap();
        client
            .write_all(&messages::haptic_tick_request(1, 25))
            .unwrap();
        assert!(!pump(&mut server, key));

        // Out of range: a per-client protocol error.
        client.write_all(&messages::power_off_request(99)).unwrap();
        assert!(pump(&mut server, key));
        assert!(server.context.clients.is_empty());
    }

    #[test]
    fn test_message_before_handshake_is_rejected() {
        use std::io::Write;
        let (mut server, key, mut client) = server_with_client();
        client
            .write_all(&messages::request(MessageId::PacketRequest))
            .unwrap();
        assert!(pump(&mut server, key));
        assert!(server.context.clients.is_empty());
        assert_eq!(server.context.active_clients, 0);
    }
}
