//! Browser WebSocket transport for the connection manager
//!
//! web-sys callbacks cannot borrow the manager, so every socket callback
//! pushes a `SocketEvent` into a shared queue and the page drains it from its
//! own timer via `LiveDashboard::poll`.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;
use tracing::{error, info, warn};
use wasm_bindgen::prelude::*;
use wasm_bindgen::JsCast;
use web_sys::{CloseEvent, ErrorEvent, MessageEvent, WebSocket};

use crate::error::{Error, Result};
use crate::manager::{SocketEvent, SocketEventKind, Transport};
use crate::ws_state::{ChannelKey, SocketId};

/// Shared event queue: socket callbacks push, `poll` drains.
pub type EventQueue = Rc<RefCell<VecDeque<SocketEvent>>>;

/// Callbacks stay owned by the socket entry and are dropped after the
/// handlers are detached on close.
struct Socket {
    ws: WebSocket,
    _on_open: Closure<dyn FnMut(JsValue)>,
    _on_message: Closure<dyn FnMut(MessageEvent)>,
    _on_error: Closure<dyn FnMut(ErrorEvent)>,
    _on_close: Closure<dyn FnMut(CloseEvent)>,
}

#[derive(Default)]
pub struct WasmTransport {
    queue: EventQueue,
    sockets: HashMap<(ChannelKey, SocketId), Socket>,
}

impl WasmTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every event queued since the last call.
    pub fn drain(&self) -> Vec<SocketEvent> {
        self.queue.borrow_mut().drain(..).collect()
    }
}

fn js_error(e: JsValue) -> Error {
    Error::Transport(format!("{e:?}"))
}

fn pusher(queue: &EventQueue, channel: &ChannelKey, socket: SocketId) -> impl Fn(SocketEventKind) {
    let queue = queue.clone();
    let channel = channel.clone();
    move |kind| {
        queue.borrow_mut().push_back(SocketEvent {
            channel: channel.clone(),
            socket,
            kind,
        });
    }
}

impl Transport for WasmTransport {
    fn open(&mut self, channel: &ChannelKey, socket: SocketId, url: &str) -> Result<()> {
        info!(%channel, %socket, url, "Connecting to WebSocket");
        let ws = WebSocket::new(url).map_err(js_error)?;

        let push = pusher(&self.queue, channel, socket);
        let on_open = Closure::wrap(Box::new(move |_| {
            push(SocketEventKind::Opened);
        }) as Box<dyn FnMut(JsValue)>);
        ws.set_onopen(Some(on_open.as_ref().unchecked_ref()));

        let push = pusher(&self.queue, channel, socket);
        let on_message = Closure::wrap(Box::new(move |e: MessageEvent| {
            if let Ok(txt) = e.data().dyn_into::<js_sys::JsString>() {
                push(SocketEventKind::Message(txt.into()));
            }
        }) as Box<dyn FnMut(MessageEvent)>);
        ws.set_onmessage(Some(on_message.as_ref().unchecked_ref()));

        let push = pusher(&self.queue, channel, socket);
        let on_error = Closure::wrap(Box::new(move |e: ErrorEvent| {
            let msg = e.message();
            error!(error = %msg, "WebSocket error");
            push(SocketEventKind::Error(msg));
        }) as Box<dyn FnMut(ErrorEvent)>);
        ws.set_onerror(Some(on_error.as_ref().unchecked_ref()));

        let push = pusher(&self.queue, channel, socket);
        let on_close = Closure::wrap(Box::new(move |e: CloseEvent| {
            let reason = e.reason();
            warn!(code = e.code(), reason = %reason, "WebSocket closed");
            push(SocketEventKind::Closed { reason });
        }) as Box<dyn FnMut(CloseEvent)>);
        ws.set_onclose(Some(on_close.as_ref().unchecked_ref()));

        self.sockets.insert(
            (channel.clone(), socket),
            Socket {
                ws,
                _on_open: on_open,
                _on_message: on_message,
                _on_error: on_error,
                _on_close: on_close,
            },
        );
        Ok(())
    }

    fn send(&mut self, channel: &ChannelKey, socket: SocketId, text: &str) -> Result<()> {
        let entry = self
            .sockets
            .get(&(channel.clone(), socket))
            .ok_or_else(|| Error::Transport(format!("socket {socket} on {channel} is gone")))?;
        entry.ws.send_with_str(text).map_err(js_error)
    }

    fn close(&mut self, channel: &ChannelKey, socket: SocketId) {
        let Some(entry) = self.sockets.remove(&(channel.clone(), socket)) else {
            return;
        };
        entry.ws.set_onopen(None);
        entry.ws.set_onmessage(None);
        entry.ws.set_onerror(None);
        entry.ws.set_onclose(None);
        if let Err(e) = entry.ws.close() {
            warn!(?e, "Failed to close WebSocket");
        }
    }
}
