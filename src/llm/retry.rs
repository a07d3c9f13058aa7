use crate::llm::GenError;
use std::future::Future;
use std::time::Duration;

/// Total attempts, including the first one.
pub const MAX_ATTEMPTS: u32 = 3;

const BACKOFF_UNIT_MS: u64 = 2000;

/// Retry loop over one generation call, spelled out as explicit states so
/// tests can drive transitions with scripted outcomes and a fake sleep.
/// Only an overload signal is retried; every other failure is final.
#[derive(Debug)]
pub enum RetryState {
    Attempting { attempt: u32 },
    Retrying { next_attempt: u32, delay: Duration },
    Succeeded(String),
    Failed(GenError),
}

/// Transition taken after attempt `attempt` resolved to `outcome`.
pub fn next_state(attempt: u32, outcome: Result<String, GenError>) -> RetryState {
    match outcome {
        Ok(text) => RetryState::Succeeded(text),
        Err(GenError::Overloaded) if attempt < MAX_ATTEMPTS => RetryState::Retrying {
            next_attempt: attempt + 1,
            delay: backoff_delay(attempt),
        },
        Err(err) => RetryState::Failed(err),
    }
}

/// Linear backoff: 2s after the first failed attempt, 4s after the second.
pub fn backoff_delay(failed_attempt: u32) -> Duration {
    Duration::from_millis(u64::from(failed_attempt) * BACKOFF_UNIT_MS)
}

/// Drives the state machine to completion. `call` performs one attempt
/// (1-based attempt number); `sleep` observes every backoff delay, which is
/// how tests assert the 2s/4s schedule without waiting.
pub async fn run<Call, CallFut, Sleep, SleepFut>(
    mut call: Call,
    mut sleep: Sleep,
) -> Result<String, GenError>
where
    Call: FnMut(u32) -> CallFut,
    CallFut: Future<Output = Result<String, GenError>>,
    Sleep: FnMut(Duration) -> SleepFut,
    SleepFut: Future<Output = ()>,
{
    let mut state = RetryState::Attempting { attempt: 1 };
    loop {
        state = match state {
            RetryState::Attempting { attempt } => next_state(attempt, call(attempt).await),
            RetryState::Retrying {
                next_attempt,
                delay,
            } => {
                sleep(delay).await;
                RetryState::Attempting {
                    attempt: next_attempt,
                }
            }
            RetryState::Succeeded(text) => return Ok(text),
            RetryState::Failed(err) => return Err(err),
        };
    }
}
