// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Client disconnect detection.
//!
//! A request is handled in two phases. While the handler primes the prefill backend and opens
//! the decode stream, axum drops the handler future if the client goes away; the handler holds
//! an armed [`ConnectionHandle`] that reports [`ConnectionStatus::ClosedUnexpectedly`] when that
//! happens. Once the response head is returned, the body stream owns a second handle, armed
//! while the body is being relayed and disarmed when it ends on its own.
//!
//! Both handles report to a detached monitor task which cancels the request's
//! [`CancellationToken`] on an unexpected close. The decode relay watches that token and stops,
//! dropping its backend connection and returning the request's load.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::http::service::metrics::Metrics;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disabled,
    ClosedUnexpectedly,
    ClosedGracefully,
}

pub struct ConnectionHandle {
    sender: Option<oneshot::Sender<ConnectionStatus>>,
    on_drop: ConnectionStatus,
}

impl ConnectionHandle {
    /// Handle which will issue a [`ConnectionStatus::ClosedUnexpectedly`] signal when dropped.
    pub fn create_armed(sender: oneshot::Sender<ConnectionStatus>) -> Self {
        Self {
            sender: Some(sender),
            on_drop: ConnectionStatus::ClosedUnexpectedly,
        }
    }

    /// Handle which will not issue a signal when dropped.
    pub fn create_disabled(sender: oneshot::Sender<ConnectionStatus>) -> Self {
        Self {
            sender: Some(sender),
            on_drop: ConnectionStatus::Disabled,
        }
    }

    pub fn disarm(&mut self) {
        self.on_drop = ConnectionStatus::ClosedGracefully;
    }

    pub fn arm(&mut self) {
        self.on_drop = ConnectionStatus::ClosedUnexpectedly;
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(self.on_drop);
        }
    }
}

/// Creates the handler's armed handle and the body's disabled handle.
pub fn create_connection_monitor(
    token: CancellationToken,
    metrics: Option<Arc<Metrics>>,
) -> (ConnectionHandle, ConnectionHandle) {
    let (connection_tx, connection_rx) = oneshot::channel();
    let (stream_tx, stream_rx) = oneshot::channel();

    // detached task that will naturally close when both handles are dropped
    tokio::spawn(connection_monitor(token, connection_rx, stream_rx, metrics));

    (
        ConnectionHandle::create_armed(connection_tx),
        ConnectionHandle::create_disabled(stream_tx),
    )
}

async fn connection_monitor(
    token: CancellationToken,
    connection_rx: oneshot::Receiver<ConnectionStatus>,
    stream_rx: oneshot::Receiver<ConnectionStatus>,
    metrics: Option<Arc<Metrics>>,
) {
    let cancel = |scope: &str| {
        if token.is_cancelled() {
            return;
        }
        tracing::debug!("{scope} closed unexpectedly; cancelling request");
        if let Some(metrics) = &metrics {
            metrics.inc_client_disconnect();
        }
        token.cancel();
    };

    match connection_rx.await {
        Err(_) | Ok(ConnectionStatus::ClosedUnexpectedly) => cancel("Connection"),
        Ok(ConnectionStatus::ClosedGracefully) => {
            tracing::trace!("Connection closed gracefully");
        }
        Ok(ConnectionStatus::Disabled) => {}
    }

    match stream_rx.await {
        Err(_) | Ok(ConnectionStatus::ClosedUnexpectedly) => cancel("Stream"),
        Ok(ConnectionStatus::ClosedGracefully) => {
            tracing::trace!("Stream closed gracefully");
        }
        Ok(ConnectionStatus::Disabled) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_dropped_handler_cancels() {
        let token = CancellationToken::new();
        let (connection, stream) = create_connection_monitor(token.clone(), None);
        drop(connection);
        drop(stream);
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_graceful_close_keeps_token() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let token = CancellationToken::new();
        let (mut connection, mut stream) =
            create_connection_monitor(token.clone(), Some(metrics.clone()));

        connection.disarm();
        stream.arm();
        drop(connection);
        stream.disarm();
        drop(stream);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!token.is_cancelled());
        assert_eq!(metrics.get_client_disconnect_count(), 0);
    }

    #[tokio::test]
    async fn test_dropped_body_cancels() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let token = CancellationToken::new();
        let (mut connection, mut stream) =
            create_connection_monitor(token.clone(), Some(metrics.clone()));

        connection.disarm();
        stream.arm();
        drop(connection);
        drop(stream);

        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();
        assert_eq!(metrics.get_client_disconnect_count(), 1);
    }
}
