// THEORY:
// The visualizer sits at the far end of the display worker. It never touches
// the run's queues; it only receives what the display worker publishes:
//
// 1.  **Frame bus.** Two tokio broadcast channels, one for JPEG previews and
//     one for the per-frame summary. Slow viewers lag and skip; they never
//     hold up the run.
// 2.  **Sink.** `BusSink` is the run's `DisplaySink`. It reports itself
//     unwatched while nobody is subscribed, so the display worker skips JPEG
//     encoding entirely when no browser is open.
// 3.  **Server** (`web` feature). An axum app streams both channels over one
//     WebSocket and forwards a few operator actions to the run's control bus.

use larva_vr::ipc::control::{ControlBus, ControlMessage};
use larva_vr::stages::{DisplayPacket, DisplaySink, PreviewSummary};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Jpeg,
}

#[derive(Debug, Clone)]
pub struct FramePacket {
    pub index: u64,
    pub ts_millis: u64,
    pub width: u32,
    pub height: u32,
    pub format: FrameFormat,
    pub data: Arc<[u8]>,
}

#[derive(Debug, Clone, Default)]
#[cfg_attr(feature = "web", derive(serde::Serialize))]
pub struct Meta {
    pub width: u32,
    pub height: u32,
    #[cfg_attr(feature = "web", serde(flatten))]
    pub summary: PreviewSummary,
}

#[derive(Clone)]
pub struct FrameBus {
    pub frames_tx: broadcast::Sender<FramePacket>,
    pub meta_tx: broadcast::Sender<Meta>,
}

impl FrameBus {
    pub fn new(capacity: usize) -> Self {
        let (frames_tx, _) = broadcast::channel::<FramePacket>(capacity.max(1));
        let (meta_tx, _) = broadcast::channel::<Meta>(capacity.max(1));
        Self { frames_tx, meta_tx }
    }

    /// True while at least one viewer is subscribed.
    pub fn watched(&self) -> bool {
        self.frames_tx.receiver_count() > 0 || self.meta_tx.receiver_count() > 0
    }

    /// A `DisplaySink` publishing onto this bus.
    pub fn sink(&self) -> BusSink {
        BusSink {
            bus: self.clone(),
            published: 0,
        }
    }
}

/// Display sink feeding a `FrameBus`.
pub struct BusSink {
    bus: FrameBus,
    published: u64,
}

impl BusSink {
    pub fn published(&self) -> u64 {
        self.published
    }
}

impl DisplaySink for BusSink {
    fn publish(&mut self, packet: DisplayPacket) -> larva_vr::Result<()> {
        let frame = FramePacket {
            index: packet.summary.index,
            ts_millis: (packet.summary.timestamp_ns.max(0) / 1_000_000) as u64,
            width: packet.width,
            height: packet.height,
            format: FrameFormat::Jpeg,
            data: packet.jpeg,
        };
        // A send error only means every viewer left since `wants_frames`.
        let _ = self.bus.frames_tx.send(frame);
        let _ = self.bus.meta_tx.send(Meta {
            width: packet.width,
            height: packet.height,
            summary: packet.summary,
        });
        self.published += 1;
        Ok(())
    }

    fn wants_frames(&self) -> bool {
        self.bus.watched()
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
}

/// Operator actions the server may forward to a running session.
#[derive(Clone)]
pub struct ControlHandle {
    bus: ControlBus,
}

impl ControlHandle {
    pub fn new(bus: ControlBus) -> Self {
        Self { bus }
    }

    /// Pauses or resumes the recorder and video writer.
    pub fn set_recording(&self, on: bool) -> usize {
        self.bus.broadcast(&ControlMessage::SetRecording(on))
    }

    /// Releases a protocol item waiting on a software trigger.
    pub fn software_trigger(&self) -> bool {
        self.bus.send_to("protocol", ControlMessage::SoftwareTrigger)
    }

    /// Restarts background estimation on every background worker.
    pub fn reset_background(&self) -> usize {
        self.bus.broadcast(&ControlMessage::ResetBackground)
    }
}

#[cfg(feature = "web")]
mod web {
    use super::{ControlHandle, FrameBus, ServerConfig};
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::extract::{Path, State};
    use axum::http::StatusCode;
    use axum::response::{Html, IntoResponse};
    use axum::routing::{get, post};
    use axum::Router;
    use futures_util::{SinkExt, StreamExt};
    use std::net::SocketAddr;
    use tokio::sync::broadcast::error::RecvError;

    const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><title>larva_vr preview</title></head>
<body style="font-family:sans-serif">
  <h2>larva_vr preview</h2>
  <div style="margin:8px 0; display:flex; gap:12px; align-items:center">
    <button onclick="fetch('/control/recording/on',{method:'POST'})">Record</button>
    <button onclick="fetch('/control/recording/off',{method:'POST'})">Pause recording</button>
    <button onclick="fetch('/control/trigger',{method:'POST'})">Trigger</button>
    <button onclick="fetch('/control/background/reset',{method:'POST'})">Reset background</button>
    <span id="status" style="font-family:monospace; font-size:12px; color:#777">connecting</span>
  </div>
  <img id="preview" style="border:1px solid #444; image-rendering:pixelated; min-width:640px">
  <pre id="meta" style="font-size:12px"></pre>
  <script>
    const ws = new WebSocket((location.protocol === 'https:' ? 'wss://' : 'ws://') + location.host + '/ws');
    ws.binaryType = 'blob';
    let url = null;
    ws.onopen = () => document.getElementById('status').textContent = 'connected';
    ws.onclose = () => document.getElementById('status').textContent = 'disconnected';
    ws.onmessage = (ev) => {
      if (typeof ev.data === 'string') {
        document.getElementById('meta').textContent = JSON.stringify(JSON.parse(ev.data), null, 1);
        return;
      }
      if (url) URL.revokeObjectURL(url);
      url = URL.createObjectURL(new Blob([ev.data], {type: 'image/jpeg'}));
      document.getElementById('preview').src = url;
    };
  </script>
</body>
</html>"#;

    #[derive(Clone)]
    struct AppState {
        bus: FrameBus,
        control: Option<ControlHandle>,
    }

    async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
        ws.on_upgrade(move |socket| stream(socket, state.bus))
    }

    /// Forwards frames as binary messages and metadata as JSON text until the
    /// viewer goes away.
    async fn stream(socket: WebSocket, bus: FrameBus) {
        let mut frames = bus.frames_tx.subscribe();
        let mut meta = bus.meta_tx.subscribe();
        let (mut tx, mut rx) = socket.split();
        loop {
            let message = tokio::select! {
                frame = frames.recv() => match frame {
                    Ok(frame) => Message::Binary(frame.data.to_vec()),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                summary = meta.recv() => match summary {
                    Ok(summary) => match serde_json::to_string(&summary) {
                        Ok(text) => Message::Text(text),
                        Err(err) => {
                            tracing::warn!(error = %err, "cannot encode preview metadata");
                            continue;
                        }
                    },
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => break,
                },
                incoming = rx.next() => match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => continue,
                },
            };
            if tx.send(message).await.is_err() {
                break;
            }
        }
        tracing::debug!("preview viewer disconnected");
    }

    async fn recording(Path(state): Path<String>, State(app): State<AppState>) -> StatusCode {
        let on = match state.as_str() {
            "on" => true,
            "off" => false,
            _ => return StatusCode::BAD_REQUEST,
        };
        match &app.control {
            Some(control) => {
                control.set_recording(on);
                StatusCode::NO_CONTENT
            }
            None => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    async fn trigger(State(app): State<AppState>) -> StatusCode {
        match &app.control {
            Some(control) if control.software_trigger() => StatusCode::NO_CONTENT,
            Some(_) => StatusCode::NOT_FOUND,
            None => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    async fn reset_background(State(app): State<AppState>) -> StatusCode {
        match &app.control {
            Some(control) => {
                control.reset_background();
                StatusCode::NO_CONTENT
            }
            None => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    pub fn router(bus: FrameBus, control: Option<ControlHandle>) -> Router {
        Router::new()
            .route("/", get(|| async { Html(INDEX_HTML) }))
            .route("/healthz", get(|| async { "ok" }))
            .route("/ws", get(ws_handler))
            .route("/control/recording/:state", post(recording))
            .route("/control/trigger", post(trigger))
            .route("/control/background/reset", post(reset_background))
            .with_state(AppState { bus, control })
    }

    pub async fn serve(
        bus: FrameBus,
        cfg: ServerConfig,
        control: Option<ControlHandle>,
    ) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
        let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
        let addr = listener.local_addr()?;
        let app = router(bus, control);
        let server = tokio::spawn(async move {
            if let Err(err) = axum::serve(listener, app).await {
                tracing::error!(error = %err, "visualizer server stopped");
            }
        });
        tracing::info!(%addr, "visualizer listening");
        Ok((addr, server))
    }
}

/// Serves the preview page, the WebSocket stream and the operator endpoints.
/// Returns the bound address, which differs from `cfg` for port 0.
#[cfg(feature = "web")]
pub async fn start_server(
    bus: FrameBus,
    cfg: ServerConfig,
    control: Option<ControlHandle>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    web::serve(bus, cfg, control).await
}

#[cfg(not(feature = "web"))]
pub async fn start_server(
    _bus: FrameBus,
    _cfg: ServerConfig,
    _control: Option<ControlHandle>,
) -> anyhow::Result<(SocketAddr, tokio::task::JoinHandle<()>)> {
    Err(anyhow::anyhow!("web feature not enabled for larva_vr_visualizer"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use larva_vr::stages::AnimalSummary;

    fn packet(index: u64) -> DisplayPacket {
        let image = image::RgbImage::from_pixel(8, 6, image::Rgb([40, 80, 120]));
        DisplayPacket {
            width: 8,
            height: 6,
            jpeg: larva_vr::stages::display::encode_jpeg(&image, 90).unwrap().into(),
            summary: PreviewSummary {
                index,
                timestamp_ns: 2_500_000_000,
                animals: vec![AnimalSummary {
                    identity: 1,
                    centroid_x: 4.0,
                    centroid_y: 3.0,
                    heading_rad: 0.5,
                    has_eyes: false,
                    has_tail: true,
                }],
            },
        }
    }

    #[test]
    fn sink_is_unwatched_without_subscribers() {
        let bus = FrameBus::new(2);
        let sink = bus.sink();
        assert!(!sink.wants_frames());
        let _viewer = bus.meta_tx.subscribe();
        assert!(sink.wants_frames());
    }

    #[test]
    fn published_previews_reach_every_viewer() {
        let bus = FrameBus::new(4);
        let mut frames = bus.frames_tx.subscribe();
        let mut meta = bus.meta_tx.subscribe();
        let mut sink = bus.sink();

        sink.publish(packet(42)).unwrap();
        assert_eq!(sink.published(), 1);

        let frame = frames.try_recv().unwrap();
        assert_eq!((frame.index, frame.ts_millis), (42, 2500));
        assert_eq!(frame.format, FrameFormat::Jpeg);
        let decoded = image::load_from_memory(&frame.data).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (8, 6));

        let meta = meta.try_recv().unwrap();
        assert_eq!(meta.summary.index, 42);
        assert_eq!(meta.summary.animals[0].identity, 1);
    }

    #[test]
    fn lagging_viewers_skip_instead_of_blocking() {
        let bus = FrameBus::new(2);
        let mut frames = bus.frames_tx.subscribe();
        let mut sink = bus.sink();
        for i in 0..5 {
            sink.publish(packet(i)).unwrap();
        }
        assert!(matches!(
            frames.try_recv(),
            Err(broadcast::error::TryRecvError::Lagged(3))
        ));
        assert_eq!(frames.try_recv().unwrap().index, 3);
        assert_eq!(frames.try_recv().unwrap().index, 4);
    }

    #[test]
    fn control_handle_reaches_registered_workers() {
        let bus = ControlBus::new();
        let protocol = bus.register("protocol");
        let background = bus.register("background_0");
        let control = ControlHandle::new(bus);

        assert!(control.software_trigger());
        assert_eq!(control.reset_background(), 2);
        assert_eq!(protocol.drain(), vec![ControlMessage::SoftwareTrigger, ControlMessage::ResetBackground]);
        assert_eq!(background.drain(), vec![ControlMessage::ResetBackground]);
    }

    #[cfg(not(feature = "web"))]
    #[tokio::test]
    async fn server_needs_the_web_feature() {
        let result = start_server(
            FrameBus::new(1),
            ServerConfig {
                bind_addr: "127.0.0.1:0".into(),
            },
            None,
        )
        .await;
        assert!(result.is_err());
    }

    #[cfg(feature = "web")]
    #[tokio::test]
    async fn health_endpoint_answers() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let (addr, server) = start_server(
            FrameBus::new(1),
            ServerConfig {
                bind_addr: "127.0.0.1:0".into(),
            },
            None,
        )
        .await
        .unwrap();
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /healthz HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));
        server.abort();
    }
}
