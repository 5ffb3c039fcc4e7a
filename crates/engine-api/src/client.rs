use std::{ffi::CString, os::unix::prelude::FileTypeExt};

use futures::{Stream, StreamExt};
use tokio_tungstenite::{client_async, tungstenite::Message};

use crate::{
    EVENTS_ROUTE,
    dto::MatchMessage,
    error::{EngineClientError, WebsocketError},
};

#[derive(Debug, Clone)]
pub struct EngineApiClient {
    socket: String,
}

impl EngineApiClient {
    pub fn new() -> Result<Self, EngineClientError> {
        Self::unix(super::DEFAULT_UDS.to_owned())
    }

    pub fn unix(socket: String) -> Result<Self, EngineClientError> {
        // Check if input exists and if it is a unix socket
        match std::fs::metadata(&socket) {
            Err(err) => {
                return match err.kind() {
                    std::io::ErrorKind::NotFound => Err(EngineClientError::SocketNotFound(socket)),
                    std::io::ErrorKind::PermissionDenied => {
                        Err(EngineClientError::NoReadPermission(socket))
                    }
                    _ => Err(EngineClientError::FailedToGetMetadata(socket)),
                };
            }
            Ok(metadata) => {
                if !metadata.file_type().is_socket() {
                    return Err(EngineClientError::NotASocket(socket));
                }
            }
        };

        // Metadata doesn't tell us the effective permission when running via
        // sudo, so ask the kernel.
        let cstring = CString::new(socket.as_str())?;

        let write_permission = unsafe { libc::access(cstring.as_ptr(), libc::W_OK) } == 0;
        if !write_permission {
            return Err(EngineClientError::NoWritePermission(socket));
        }

        Ok(Self { socket })
    }

    pub fn socket(&self) -> &str {
        &self.socket
    }

    /// Open the match stream.
    pub async fn event_monitor(
        &self,
    ) -> Result<impl Stream<Item = Result<MatchMessage, WebsocketError>>, EngineClientError> {
        let stream = tokio::net::UnixStream::connect(&self.socket)
            .await
            .map_err(EngineClientError::SocketConnectionError)?;

        // The `localhost` domain is simply a placeholder for the url. It's not used because is already present a stream
        let (ws_stream, _) = client_async(format!("ws://localhost{EVENTS_ROUTE}"), stream)
            .await
            .map_err(|e| EngineClientError::WebSocketError(Box::new(e)))?;

        let (_, read_stream) = ws_stream.split();

        let matches = read_stream.filter_map(|item| async move {
            match item {
                Ok(Message::Text(json)) => {
                    Some(serde_json::from_str::<MatchMessage>(&json).map_err(WebsocketError::from))
                }
                Ok(Message::Ping(_) | Message::Pong(_) | Message::Close(_)) => None,
                Ok(_) => Some(Err(WebsocketError::UnsupportedMessageType)),
                Err(err) => Some(Err(err.into())),
            }
        });

        Ok(matches)
    }
}
