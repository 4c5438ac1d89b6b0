//! Master side: the transaction engine

use tracing::Instrument;

use crate::error::{RequestError, TransactionError};
use crate::retry::RetryStrategy;
use crate::transport::Transport;
use crate::types::{Pdu, UnitId};

/// Per-engine retry behavior
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct TransactionOptions {
    /// total number of send attempts per transaction, including the first
    pub max_attempts: usize,
    /// close and re-establish the connection at the start of every transaction
    pub reconnect_each_transaction: bool,
}

impl Default for TransactionOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            reconnect_each_transaction: false,
        }
    }
}

/// Executes request/response transactions over an owned transport, retrying
/// retryable failures up to the attempt budget. `&mut self` keeps exactly one
/// transaction in flight per transport.
pub struct TransactionEngine {
    transport: Transport,
    options: TransactionOptions,
    retry: Box<dyn RetryStrategy>,
    transaction_count: u64,
}

impl TransactionEngine {
    /// Create an engine that owns `transport`
    pub fn new(transport: Transport, options: TransactionOptions) -> Self {
        Self {
            transport,
            options: TransactionOptions {
                // zero attempts would make every transaction a silent no-op
                max_attempts: options.max_attempts.max(1),
                ..options
            },
            retry: crate::retry::default_retry_strategy(),
            transaction_count: 0,
        }
    }

    /// Replace the delay strategy applied between failed attempts
    pub fn set_retry_strategy(&mut self, strategy: Box<dyn RetryStrategy>) {
        self.retry = strategy;
    }

    /// Execute one transaction: send `request` to `unit` and return the
    /// correlated response
    pub async fn execute(
        &mut self,
        unit: UnitId,
        request: Pdu,
    ) -> Result<Pdu, TransactionError> {
        self.transaction_count += 1;
        let span = tracing::info_span!("Transaction", id = self.transaction_count);
        self.execute_inner(unit, request).instrument(span).await
    }

    async fn execute_inner(
        &mut self,
        unit: UnitId,
        request: Pdu,
    ) -> Result<Pdu, TransactionError> {
        if self.options.reconnect_each_transaction {
            self.transport.close();
        }

        let mut last_error = RequestError::NoConnection;
        for attempt in 1..=self.options.max_attempts {
            match self.attempt(unit, &request).await {
                Ok(response) => {
                    self.retry.reset();
                    return Ok(response);
                }
                Err(err) if err.is_retryable() => {
                    tracing::warn!(
                        "attempt {attempt}/{} failed: {err}",
                        self.options.max_attempts
                    );
                    last_error = err;
                    // a timed-out connection is still usable, a broken one is not
                    let disconnected =
                        matches!(err, RequestError::Io(_) | RequestError::NoConnection);
                    if disconnected {
                        self.transport.close();
                    }
                    if attempt < self.options.max_attempts {
                        let delay = if disconnected {
                            self.retry.after_disconnect()
                        } else {
                            self.retry.after_failed_connect()
                        };
                        tokio::time::sleep(delay).await;
                    }
                }
                Err(err) => return Err(TransactionError::Aborted(err)),
            }
        }

        Err(TransactionError::Failed {
            attempts: self.options.max_attempts,
            source: last_error,
        })
    }

    async fn attempt(&mut self, unit: UnitId, request: &Pdu) -> Result<Pdu, RequestError> {
        self.transport.connect().await?;
        let header = self.transport.write_request(unit, request).await?;
        self.transport.read_response(header).await
    }

    /// Close the underlying transport. The next transaction reconnects.
    pub fn close(&mut self) {
        self.transport.close();
    }
}

impl std::fmt::Debug for TransactionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TransactionEngine")
            .field("remote", &self.transport.remote())
            .field("options", &self.options)
            .field("transaction_count", &self.transaction_count)
            .finish_non_exhaustive()
    }
}

impl PartialEq for TransactionEngine {
    /// engines are interchangeable iff they address the same remote endpoint
    fn eq(&self, other: &Self) -> bool {
        match (self.transport.remote(), other.transport.remote()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::common::frame::FramingMode;
    use crate::error::FrameParseError;
    use crate::transport::{Role, Transport, TransportOptions};
    use tokio_test::io::Builder;

    const UNIT_ID: u8 = 0x2A;

    const RTU_REQUEST: &[u8] = &[UNIT_ID, 0x01, 0x00, 0x10, 0x00, 0x13, 0x7A, 0x19];
    const RTU_RESPONSE: &[u8] = &[UNIT_ID, 0x01, 0x03, 0xCD, 0x6B, 0x05, 0x44, 0x99];

    fn request_pdu() -> Pdu {
        Pdu::new(0x01, vec![0x00, 0x10, 0x00, 0x13])
    }

    fn rtu_engine(io: tokio_test::io::Mock, max_attempts: usize) -> TransactionEngine {
        let transport = Transport::mock(
            io,
            FramingMode::Rtu,
            Role::Master,
            false,
            TransportOptions::default(),
        );
        TransactionEngine::new(
            transport,
            TransactionOptions {
                max_attempts,
                reconnect_each_transaction: false,
            },
        )
    }

    #[tokio::test]
    async fn returns_response_on_first_attempt() {
        let io = Builder::new().write(RTU_REQUEST).read(RTU_RESPONSE).build();
        let mut engine = rtu_engine(io, 3);
        let response = engine
            .execute(UnitId::new(UNIT_ID), request_pdu())
            .await
            .unwrap();
        assert_eq!(response.data(), &[0x03, 0xCD, 0x6B, 0x05]);
    }

    #[tokio::test(start_paused = true)]
    async fn sends_exactly_the_attempt_budget_when_unresponsive() {
        // three writes and no reads: every attempt must time out
        let io = Builder::new()
            .write(RTU_REQUEST)
            .write(RTU_REQUEST)
            .write(RTU_REQUEST)
            .wait(Duration::from_secs(3600))
            .build();
        let mut engine = rtu_engine(io, 3);
        let err = engine
            .execute(UnitId::new(UNIT_ID), request_pdu())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransactionError::Failed {
                attempts: 3,
                source: RequestError::ResponseTimeout,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retries_after_timeout_and_returns_late_success() {
        let io = Builder::new()
            .write(RTU_REQUEST)
            .wait(Duration::from_secs(2))
            .write(RTU_REQUEST)
            .read(RTU_RESPONSE)
            .build();
        let mut engine = rtu_engine(io, 2);
        let response = engine
            .execute(UnitId::new(UNIT_ID), request_pdu())
            .await
            .unwrap();
        assert_eq!(response.data(), &[0x03, 0xCD, 0x6B, 0x05]);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_io_error_and_reports_the_final_failure() {
        let io = Builder::new()
            .write(RTU_REQUEST)
            .read_error(std::io::Error::from(std::io::ErrorKind::ConnectionReset))
            .build();
        let mut engine = rtu_engine(io, 2);
        let err = engine
            .execute(UnitId::new(UNIT_ID), request_pdu())
            .await
            .unwrap_err();
        // the broken mock is dropped on close, so the second attempt cannot connect
        assert_eq!(
            err,
            TransactionError::Failed {
                attempts: 2,
                source: RequestError::NoConnection,
            }
        );
    }

    #[tokio::test]
    async fn aborts_on_discard_limit_without_retrying() {
        const BAD_CRC: &[u8] = &[UNIT_ID, 0x01, 0x03, 0xCD, 0x6B, 0x05, 0xFF, 0xFF];

        let io = Builder::new()
            .write(RTU_REQUEST)
            .read(BAD_CRC)
            .read(BAD_CRC)
            .build();
        let transport = Transport::mock(
            io,
            FramingMode::Rtu,
            Role::Master,
            false,
            TransportOptions {
                max_discards: 1,
                ..Default::default()
            },
        );
        let mut engine = TransactionEngine::new(transport, TransactionOptions::default());
        let err = engine
            .execute(UnitId::new(UNIT_ID), request_pdu())
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransactionError::Aborted(RequestError::BadFrame(FrameParseError::DiscardLimit(1)))
        );
    }

    #[tokio::test]
    async fn engines_compare_by_remote_endpoint() {
        let options = TransportOptions::default();
        let a = TransactionEngine::new(
            Transport::tcp("10.0.0.1:502".parse().unwrap(), options),
            TransactionOptions::default(),
        );
        let b = TransactionEngine::new(
            Transport::tcp("10.0.0.1:502".parse().unwrap(), options),
            TransactionOptions::default(),
        );
        let c = TransactionEngine::new(
            Transport::tcp("10.0.0.1:503".parse().unwrap(), options),
            TransactionOptions::default(),
        );
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
