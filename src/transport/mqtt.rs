//! MQTT transport adapter.
//!
//! Leaf of the pipeline: maps the handler interface onto the hub's MQTT
//! conventions over a rumqttc client. Telemetry publishes to
//! `devices/{id}/messages/events/`, twin and direct-method traffic rides
//! the `$iothub/…` request/response topics with `$rid` correlation, and
//! server-initiated events arriving on subscribed topics are routed to
//! the event dispatcher.
//!
//! The adapter deliberately does not let rumqttc reconnect on its own:
//! the event loop task exits on the first connection error and completes
//! the transport-closed signal, leaving recovery to the lifecycle stage
//! of the pipeline.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, MqttOptions, Outgoing,
    Packet, Publish, QoS,
};
use tokio::sync::{oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::SasTokenError;
use crate::error::IotHubError;
use crate::message::{
    DirectMethodRequest, DirectMethodResponse, LockToken, PropertyBag, ReceivedMessage,
    TelemetryMessage, TwinDocument, TwinUpdateResponse,
};
use crate::pipeline::{ClosedReason, PipelineError, PipelineHandler, SubscriptionKind};
use crate::retry::RetryPolicy;
use crate::transport::{TransportError, TransportFactory, TransportKind, TransportSettings};

const API_VERSION: &str = "2021-04-12";
const TWIN_RESPONSE_FILTER: &str = "$iothub/twin/res/#";

/// Builds [`MqttTransport`] instances for the protocol routing stage.
#[derive(Debug, Clone, Copy)]
pub struct MqttTransportFactory {
    kind: TransportKind,
}

impl MqttTransportFactory {
    pub fn tcp() -> Self {
        MqttTransportFactory {
            kind: TransportKind::MqttTcp,
        }
    }

    #[cfg(feature = "transport-ws")]
    pub fn websocket() -> Self {
        MqttTransportFactory {
            kind: TransportKind::MqttWebSocket,
        }
    }
}

impl TransportFactory for MqttTransportFactory {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn create(&self, settings: &TransportSettings) -> Arc<dyn PipelineHandler> {
        Arc::new(MqttTransport::new(self.kind, settings.clone()))
    }
}

/// Correlated answer to a twin request.
struct TwinResponse {
    status: u16,
    version: Option<i64>,
    payload: Bytes,
}

struct Connection {
    client: AsyncClient,
    cancel: CancellationToken,
    closed_rx: watch::Receiver<Option<ClosedReason>>,
    task: JoinHandle<()>,
}

struct MqttShared {
    usable: AtomicBool,
    conn: Mutex<Option<Connection>>,
    /// C2D and input messages without a registered callback, waiting for
    /// `receive_message`.
    inbox: Mutex<VecDeque<ReceivedMessage>>,
    inbox_notify: Notify,
    /// In-flight twin requests by `$rid`.
    pending_twin: Mutex<HashMap<u64, oneshot::Sender<TwinResponse>>>,
    next_rid: AtomicU64,
    twin_subscribed: AtomicBool,
}

pub struct MqttTransport {
    kind: TransportKind,
    settings: TransportSettings,
    shared: Arc<MqttShared>,
}

impl fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttTransport")
            .field("kind", &self.kind)
            .field("device_id", &self.settings.device_id)
            .finish()
    }
}

impl MqttTransport {
    pub fn new(kind: TransportKind, settings: TransportSettings) -> Self {
        MqttTransport {
            kind,
            settings,
            shared: Arc::new(MqttShared {
                usable: AtomicBool::new(true),
                conn: Mutex::new(None),
                inbox: Mutex::new(VecDeque::new()),
                inbox_notify: Notify::new(),
                pending_twin: Mutex::new(HashMap::new()),
                next_rid: AtomicU64::new(1),
                twin_subscribed: AtomicBool::new(false),
            }),
        }
    }

    /// `{device_id}` or `{device_id}/{module_id}`.
    fn client_id(&self) -> String {
        match &self.settings.module_id {
            Some(module_id) => format!("{}/{}", self.settings.device_id, module_id),
            None => self.settings.device_id.clone(),
        }
    }

    fn client(&self) -> Result<AsyncClient, PipelineError> {
        self.shared
            .conn
            .lock()
            .unwrap()
            .as_ref()
            .map(|conn| conn.client.clone())
            .ok_or_else(|| IotHubError::not_opened().into())
    }

    fn topic_filter(&self, kind: SubscriptionKind) -> Result<(String, QoS), TransportError> {
        let filter = match kind {
            SubscriptionKind::CloudToDeviceMessages => (
                format!("devices/{}/messages/devicebound/#", self.settings.device_id),
                QoS::AtLeastOnce,
            ),
            SubscriptionKind::DirectMethods => {
                ("$iothub/methods/POST/#".to_owned(), QoS::AtMostOnce)
            }
            SubscriptionKind::DesiredPropertyUpdates => (
                "$iothub/twin/PATCH/properties/desired/#".to_owned(),
                QoS::AtMostOnce,
            ),
            SubscriptionKind::InputEvents => match &self.settings.module_id {
                Some(module_id) => (
                    format!(
                        "devices/{}/modules/{}/inputs/#",
                        self.settings.device_id, module_id
                    ),
                    QoS::AtLeastOnce,
                ),
                None => {
                    return Err(TransportError::Protocol {
                        message: "input events require a module identity".to_owned(),
                    })
                }
            },
        };
        Ok(filter)
    }

    fn telemetry_topic(&self, message: &TelemetryMessage) -> String {
        let base = match &self.settings.module_id {
            Some(module_id) => format!(
                "devices/{}/modules/{}/messages/events/",
                self.settings.device_id, module_id
            ),
            None => format!("devices/{}/messages/events/", self.settings.device_id),
        };
        format!("{base}{}", telemetry_property_bag(message))
    }

    /// The twin response topic serves all twin requests; subscribed once
    /// per transport, on first use.
    async fn ensure_twin_subscription(&self, client: &AsyncClient) -> Result<(), PipelineError> {
        if self.shared.twin_subscribed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        client
            .subscribe(TWIN_RESPONSE_FILTER, QoS::AtMostOnce)
            .await
            .map_err(|_| request_channel_closed())?;
        Ok(())
    }

    /// Publishes a twin request and awaits its correlated response.
    async fn twin_request(
        &self,
        topic_prefix: &str,
        payload: Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<TwinResponse, PipelineError> {
        let client = self.client()?;
        self.ensure_twin_subscription(&client).await?;

        let rid = self.shared.next_rid.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.shared.pending_twin.lock().unwrap().insert(rid, tx);

        let topic = format!("{topic_prefix}?$rid={rid}");
        if let Err(error) = client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
        {
            self.shared.pending_twin.lock().unwrap().remove(&rid);
            debug!(%error, "twin request publish failed");
            return Err(request_channel_closed().into());
        }

        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.shared.pending_twin.lock().unwrap().remove(&rid);
                Err(IotHubError::cancelled().into())
            }
            response = rx => response.map_err(|_| {
                PipelineError::from(TransportError::Network(
                    "connection closed while awaiting twin response".to_owned(),
                ))
            }),
        }
    }
}

#[async_trait]
impl PipelineHandler for MqttTransport {
    async fn open(&self, cancel: CancellationToken) -> Result<(), PipelineError> {
        if self.shared.conn.lock().unwrap().is_some() {
            return Ok(());
        }
        self.shared.usable.store(true, Ordering::SeqCst);

        let sas = self
            .settings
            .sas_provider
            .get_token()
            .await
            .map_err(|error| match error {
                SasTokenError::Network(message) => TransportError::Network(message),
                SasTokenError::Rejected(message) => TransportError::Unauthorized {
                    message,
                    tracking_id: None,
                },
            })?;

        let client_id = self.client_id();
        let broker = match self.kind {
            #[cfg(feature = "transport-ws")]
            TransportKind::MqttWebSocket => format!(
                "ws://{}:{}/$iothub/websocket",
                self.settings.hostname, self.settings.port
            ),
            _ => self.settings.hostname.clone(),
        };
        let mut options = MqttOptions::new(client_id.clone(), broker, self.settings.port);
        options.set_keep_alive(self.settings.keep_alive);
        options.set_clean_session(false);
        options.set_credentials(
            format!(
                "{}/{}/?api-version={}",
                self.settings.hostname, client_id, API_VERSION
            ),
            sas.token,
        );
        #[cfg(feature = "transport-ws")]
        if self.kind == TransportKind::MqttWebSocket {
            options.set_transport(rumqttc::Transport::Ws);
        }

        let (client, mut event_loop) = AsyncClient::new(options, 10);

        // drive the event loop by hand until the broker accepts or
        // rejects the connection
        loop {
            let event = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(IotHubError::cancelled().into()),
                event = event_loop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => match ack.code {
                    ConnectReturnCode::Success => break,
                    code => return Err(connect_refused(code).into()),
                },
                Ok(_) => {}
                Err(error) => return Err(map_connection_error(error).into()),
            }
        }
        info!(transport = %self.kind, device_id = %self.settings.device_id, "connected");

        let task_cancel = CancellationToken::new();
        let (closed_tx, closed_rx) = watch::channel(None);
        let task = tokio::spawn(run_event_loop(
            event_loop,
            Arc::clone(&self.shared),
            self.settings.clone(),
            closed_tx,
            task_cancel.clone(),
        ));
        *self.shared.conn.lock().unwrap() = Some(Connection {
            client,
            cancel: task_cancel,
            closed_rx,
            task,
        });
        Ok(())
    }

    async fn close(&self, _cancel: CancellationToken) -> Result<(), PipelineError> {
        let conn = self.shared.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            // the disconnect packet makes the event loop task report a
            // graceful close; the token is the backstop if the packet
            // never makes it out
            let _ = conn.client.disconnect().await;
            conn.cancel.cancel();
        }
        self.shared.twin_subscribed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send_telemetry(
        &self,
        message: TelemetryMessage,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let client = self.client()?;
        let topic = self.telemetry_topic(&message);
        client
            .publish(topic, QoS::AtLeastOnce, false, message.payload.to_vec())
            .await
            .map_err(|_| request_channel_closed())?;
        Ok(())
    }

    async fn send_telemetry_batch(
        &self,
        messages: Vec<TelemetryMessage>,
        cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        // MQTT has no batch frame; elements are sent individually
        for message in messages {
            self.send_telemetry(message, cancel.clone()).await?;
        }
        Ok(())
    }

    async fn receive_message(
        &self,
        cancel: CancellationToken,
    ) -> Result<ReceivedMessage, PipelineError> {
        loop {
            if let Some(message) = self.shared.inbox.lock().unwrap().pop_front() {
                return Ok(message);
            }
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(IotHubError::cancelled().into()),
                () = self.shared.inbox_notify.notified() => {}
            }
        }
    }

    async fn complete_message(
        &self,
        _lock_token: LockToken,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        // QoS 1 deliveries are acknowledged by the MQTT client when the
        // publish is taken off the event loop
        Ok(())
    }

    async fn abandon_message(
        &self,
        _lock_token: LockToken,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        Err(TransportError::Protocol {
            message: "abandon is not supported over the MQTT transport".to_owned(),
        }
        .into())
    }

    async fn reject_message(
        &self,
        _lock_token: LockToken,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        Err(TransportError::Protocol {
            message: "reject is not supported over the MQTT transport".to_owned(),
        }
        .into())
    }

    async fn get_twin(&self, cancel: CancellationToken) -> Result<TwinDocument, PipelineError> {
        let response = self
            .twin_request("$iothub/twin/GET/", Vec::new(), &cancel)
            .await?;
        check_twin_status(response.status)?;
        let twin = serde_json::from_slice(&response.payload).map_err(|error| {
            TransportError::Protocol {
                message: format!("malformed twin document: {error}"),
            }
        })?;
        Ok(twin)
    }

    async fn update_reported_properties(
        &self,
        patch: serde_json::Value,
        cancel: CancellationToken,
    ) -> Result<TwinUpdateResponse, PipelineError> {
        let payload = serde_json::to_vec(&patch).map_err(|error| TransportError::Protocol {
            message: format!("unserializable reported-properties patch: {error}"),
        })?;
        let response = self
            .twin_request("$iothub/twin/PATCH/properties/reported/", payload, &cancel)
            .await?;
        check_twin_status(response.status)?;
        let version = response.version.ok_or_else(|| TransportError::Protocol {
            message: "twin update response carried no $version".to_owned(),
        })?;
        Ok(TwinUpdateResponse { version })
    }

    async fn send_method_response(
        &self,
        response: DirectMethodResponse,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let client = self.client()?;
        let payload =
            serde_json::to_vec(&response.payload).map_err(|error| TransportError::Protocol {
                message: format!("unserializable method response: {error}"),
            })?;
        let topic = format!(
            "$iothub/methods/res/{}/?$rid={}",
            response.status, response.request_id
        );
        client
            .publish(topic, QoS::AtMostOnce, false, payload)
            .await
            .map_err(|_| request_channel_closed())?;
        Ok(())
    }

    async fn refresh_sas_token(
        &self,
        _cancel: CancellationToken,
    ) -> Result<DateTime<Utc>, PipelineError> {
        // a fresh token takes effect on the next connect; MQTT 3.1.1 has
        // no in-band re-authentication
        let sas = self
            .settings
            .sas_provider
            .get_token()
            .await
            .map_err(|error| match error {
                SasTokenError::Network(message) => TransportError::Network(message),
                SasTokenError::Rejected(message) => TransportError::Unauthorized {
                    message,
                    tracking_id: None,
                },
            })?;
        Ok(sas.expires_at)
    }

    async fn enable_subscription(
        &self,
        kind: SubscriptionKind,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let client = self.client()?;
        let (filter, qos) = self.topic_filter(kind)?;
        client
            .subscribe(filter, qos)
            .await
            .map_err(|_| request_channel_closed())?;
        Ok(())
    }

    async fn disable_subscription(
        &self,
        kind: SubscriptionKind,
        _cancel: CancellationToken,
    ) -> Result<(), PipelineError> {
        let client = self.client()?;
        let (filter, _) = self.topic_filter(kind)?;
        client
            .unsubscribe(filter)
            .await
            .map_err(|_| request_channel_closed())?;
        Ok(())
    }

    async fn wait_for_transport_closed(&self) -> ClosedReason {
        let rx = self
            .shared
            .conn
            .lock()
            .unwrap()
            .as_ref()
            .map(|conn| conn.closed_rx.clone());
        let Some(mut rx) = rx else {
            return ClosedReason::Graceful;
        };
        loop {
            if let Some(reason) = *rx.borrow_and_update() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return ClosedReason::Unexpected;
            }
        }
    }

    fn set_retry_policy(&self, _policy: Arc<dyn RetryPolicy>) {}

    fn is_usable(&self) -> bool {
        self.shared.usable.load(Ordering::SeqCst)
    }

    fn dispose(&self) {
        self.shared.usable.store(false, Ordering::SeqCst);
        let conn = self.shared.conn.lock().unwrap().take();
        if let Some(conn) = conn {
            conn.cancel.cancel();
            conn.task.abort();
        }
    }
}

/// Owns the rumqttc event loop after a successful connect: routes
/// incoming publishes and completes the transport-closed signal when the
/// connection ends.
async fn run_event_loop(
    mut event_loop: EventLoop,
    shared: Arc<MqttShared>,
    settings: TransportSettings,
    closed_tx: watch::Sender<Option<ClosedReason>>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                let _ = closed_tx.send(Some(ClosedReason::Graceful));
                return;
            }
            event = event_loop.poll() => event,
        };
        match event {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                route_publish(&shared, &settings, publish);
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("disconnect sent, event loop ending");
                let _ = closed_tx.send(Some(ClosedReason::Graceful));
                return;
            }
            Ok(_) => {}
            Err(error) => {
                warn!(%error, "mqtt connection failed");
                shared.usable.store(false, Ordering::SeqCst);
                // fail any in-flight twin requests
                shared.pending_twin.lock().unwrap().clear();
                let _ = closed_tx.send(Some(ClosedReason::Unexpected));
                return;
            }
        }
    }
}

fn route_publish(shared: &Arc<MqttShared>, settings: &TransportSettings, publish: Publish) {
    let topic = publish.topic.clone();
    let payload = publish.payload.clone();

    if let Some(rest) = topic.strip_prefix("$iothub/twin/res/") {
        let (status, query) = match rest.split_once("/?") {
            Some((status, query)) => (status, query),
            None => {
                warn!(%topic, "malformed twin response topic");
                return;
            }
        };
        let Ok(status) = status.parse::<u16>() else {
            warn!(%topic, "unparseable twin response status");
            return;
        };
        let query = parse_query(query);
        let Some(rid) = query.get("$rid").and_then(|rid| rid.parse::<u64>().ok()) else {
            warn!(%topic, "twin response without $rid");
            return;
        };
        let version = query.get("$version").and_then(|v| v.parse::<i64>().ok());
        let pending = shared.pending_twin.lock().unwrap().remove(&rid);
        match pending {
            Some(tx) => {
                let _ = tx.send(TwinResponse {
                    status,
                    version,
                    payload,
                });
            }
            None => debug!(rid, "twin response with no pending request"),
        }
        return;
    }

    if let Some(rest) = topic.strip_prefix("$iothub/twin/PATCH/properties/desired/") {
        let version = rest
            .strip_prefix('?')
            .map(parse_query)
            .and_then(|query| query.get("$version").and_then(|v| v.parse::<i64>().ok()));
        let patch = serde_json::from_slice(&payload).unwrap_or(serde_json::Value::Null);
        settings
            .dispatcher
            .dispatch_desired_update(crate::message::DesiredPropertyUpdate { patch, version });
        return;
    }

    if let Some(rest) = topic.strip_prefix("$iothub/methods/POST/") {
        let (name, query) = match rest.split_once("/?") {
            Some((name, query)) => (name, query),
            None => {
                warn!(%topic, "malformed method request topic");
                return;
            }
        };
        let Some(rid) = parse_query(query).get("$rid").map(|rid| rid.to_string()) else {
            warn!(%topic, "method request without $rid");
            return;
        };
        let request = DirectMethodRequest {
            name: percent_decode(name),
            request_id: rid,
            payload: serde_json::from_slice(&payload).unwrap_or(serde_json::Value::Null),
        };
        settings.dispatcher.dispatch_method(request);
        return;
    }

    let c2d_prefix = format!("devices/{}/messages/devicebound", settings.device_id);
    if let Some(rest) = topic.strip_prefix(&c2d_prefix) {
        let bag = rest.strip_prefix('/').unwrap_or("");
        let message = received_message(&publish, bag, None);
        if let Err(message) = settings.dispatcher.dispatch_message(message) {
            shared.inbox.lock().unwrap().push_back(message);
            shared.inbox_notify.notify_one();
        }
        return;
    }

    if let Some(module_id) = &settings.module_id {
        let input_prefix = format!(
            "devices/{}/modules/{}/inputs/",
            settings.device_id, module_id
        );
        if let Some(rest) = topic.strip_prefix(&input_prefix) {
            let (input_name, bag) = match rest.split_once('/') {
                Some((input_name, bag)) => (percent_decode(input_name), bag),
                None => (percent_decode(rest), ""),
            };
            let message = received_message(&publish, bag, Some(input_name.clone()));
            if let Err(message) = settings.dispatcher.dispatch_input(&input_name, message) {
                shared.inbox.lock().unwrap().push_back(message);
                shared.inbox_notify.notify_one();
            }
            return;
        }
    }

    debug!(%topic, "publish on unexpected topic ignored");
}

/// Builds a [`ReceivedMessage`] from a publish and its property bag.
fn received_message(publish: &Publish, bag: &str, input_name: Option<String>) -> ReceivedMessage {
    let mut message_id = None;
    let mut correlation_id = None;
    let mut enqueued_at = None;
    let mut properties = PropertyBag::new();
    for (key, value) in parse_property_bag(bag) {
        match key.as_str() {
            "$.mid" => message_id = Some(value),
            "$.cid" => correlation_id = Some(value),
            "iothub-enqueuedtime" | "$.ctime" => {
                enqueued_at = DateTime::parse_from_rfc3339(&value)
                    .ok()
                    .map(|t| t.with_timezone(&Utc));
            }
            // remaining system properties are not surfaced individually
            _ if key.starts_with("$.") || key.starts_with("iothub-") => {}
            _ => properties.push((key, value)),
        }
    }
    ReceivedMessage {
        payload: publish.payload.clone(),
        lock_token: LockToken::new(publish.pkid.to_string()),
        message_id,
        correlation_id,
        input_name,
        enqueued_at,
        properties,
    }
}

/// System properties plus application properties, url-encoded the way the
/// hub expects them appended to the telemetry topic.
fn telemetry_property_bag(message: &TelemetryMessage) -> String {
    let mut pairs: Vec<(String, String)> = Vec::new();
    if let Some(message_id) = &message.message_id {
        pairs.push(("$.mid".to_owned(), message_id.clone()));
    }
    if let Some(correlation_id) = &message.correlation_id {
        pairs.push(("$.cid".to_owned(), correlation_id.clone()));
    }
    if let Some(content_type) = &message.content_type {
        pairs.push(("$.ct".to_owned(), content_type.clone()));
    }
    if let Some(content_encoding) = &message.content_encoding {
        pairs.push(("$.ce".to_owned(), content_encoding.clone()));
    }
    if let Some(output_name) = &message.output_name {
        pairs.push(("$.on".to_owned(), output_name.clone()));
    }
    for (key, value) in &message.properties {
        pairs.push((key.clone(), value.clone()));
    }

    let mut bag = String::new();
    for (index, (key, value)) in pairs.iter().enumerate() {
        if index > 0 {
            bag.push('&');
        }
        bag.push_str(&percent_encode(key));
        bag.push('=');
        bag.push_str(&percent_encode(value));
    }
    bag
}

fn parse_property_bag(bag: &str) -> Vec<(String, String)> {
    bag.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((key, value)) => (percent_decode(key), percent_decode(value)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn parse_query(query: &str) -> HashMap<String, String> {
    parse_property_bag(query).into_iter().collect()
}

fn percent_encode(value: &str) -> String {
    let mut encoded = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                let _ = write!(encoded, "%{byte:02X}");
            }
        }
    }
    encoded
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut index = 0;
    while index < bytes.len() {
        if bytes[index] == b'%' && index + 3 <= bytes.len() {
            if let Some(byte) = value
                .get(index + 1..index + 3)
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
            {
                decoded.push(byte);
                index += 3;
                continue;
            }
        }
        decoded.push(bytes[index]);
        index += 1;
    }
    String::from_utf8_lossy(&decoded).into_owned()
}

fn request_channel_closed() -> TransportError {
    // the request channel only closes when the event loop is gone, which
    // means the connection is gone
    TransportError::Network("mqtt client request channel closed".to_owned())
}

fn connect_refused(code: ConnectReturnCode) -> TransportError {
    match code {
        ConnectReturnCode::NotAuthorized | ConnectReturnCode::BadUserNamePassword => {
            TransportError::Unauthorized {
                message: format!("broker refused the connection: {code:?}"),
                tracking_id: None,
            }
        }
        ConnectReturnCode::ServiceUnavailable => TransportError::ServerBusy { tracking_id: None },
        code => TransportError::Protocol {
            message: format!("broker refused the connection: {code:?}"),
        },
    }
}

fn map_connection_error(error: ConnectionError) -> TransportError {
    match error {
        ConnectionError::Io(io_error) => TransportError::Io(io_error),
        ConnectionError::ConnectionRefused(code) => connect_refused(code),
        ConnectionError::MqttState(state_error) => {
            TransportError::Network(state_error.to_string())
        }
        other => TransportError::Other(other.to_string()),
    }
}

fn check_twin_status(status: u16) -> Result<(), TransportError> {
    match status {
        200..=299 => Ok(()),
        400 => Err(TransportError::Protocol {
            message: "the service rejected the twin request as malformed".to_owned(),
        }),
        401 | 403 => Err(TransportError::Unauthorized {
            message: format!("twin request rejected with status {status}"),
            tracking_id: None,
        }),
        404 => Err(TransportError::DeviceNotFound { tracking_id: None }),
        412 => Err(TransportError::LockLost("$version".to_owned())),
        413 => Err(TransportError::MessageTooLarge { limit: None }),
        429 => Err(TransportError::Throttled { tracking_id: None }),
        500..=599 => Err(TransportError::ServerBusy { tracking_id: None }),
        status => Err(TransportError::Other(format!(
            "twin request failed with status {status}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn telemetry_bag_encodes_system_and_custom_properties() {
        let message = TelemetryMessage::new("{}")
            .with_message_id("m 1")
            .with_property("zone", "a/b");
        let mut message = message;
        message.content_type = Some("application/json".to_owned());

        let bag = telemetry_property_bag(&message);
        assert_eq!(bag, "%24.mid=m%201&%24.ct=application%2Fjson&zone=a%2Fb");
    }

    #[test]
    fn empty_telemetry_bag_is_empty() {
        let message = TelemetryMessage::new("{}");
        assert_eq!(telemetry_property_bag(&message), "");
    }

    #[test]
    fn property_bag_round_trips() {
        let decoded = parse_property_bag("%24.mid=m%201&zone=a%2Fb&flag=");
        assert_eq!(
            decoded,
            vec![
                ("$.mid".to_owned(), "m 1".to_owned()),
                ("zone".to_owned(), "a/b".to_owned()),
                ("flag".to_owned(), String::new()),
            ]
        );
    }

    #[test]
    fn query_parsing_extracts_rid_and_version() {
        let query = parse_query("$rid=7&$version=12");
        assert_eq!(
            query,
            maplit::hashmap! {
                "$rid".to_owned() => "7".to_owned(),
                "$version".to_owned() => "12".to_owned(),
            }
        );
    }

    #[test]
    fn twin_status_mapping() {
        assert!(check_twin_status(204).is_ok());
        assert_eq!(
            crate::error::classify(&check_twin_status(401).unwrap_err()),
            ErrorCode::Unauthorized
        );
        assert_eq!(
            crate::error::classify(&check_twin_status(404).unwrap_err()),
            ErrorCode::DeviceNotFound
        );
        assert_eq!(
            crate::error::classify(&check_twin_status(429).unwrap_err()),
            ErrorCode::Throttled
        );
        assert_eq!(
            crate::error::classify(&check_twin_status(503).unwrap_err()),
            ErrorCode::ServerBusy
        );
    }

    #[test]
    fn refused_connection_codes_classify() {
        assert_eq!(
            crate::error::classify(&connect_refused(ConnectReturnCode::NotAuthorized)),
            ErrorCode::Unauthorized
        );
        assert_eq!(
            crate::error::classify(&connect_refused(ConnectReturnCode::ServiceUnavailable)),
            ErrorCode::ServerBusy
        );
    }
}
