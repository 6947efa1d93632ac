//! Pre-flight check

use thiserror::Error;
use tracing::{info, warn};

use tello_shared::broker::BrokerConnector;
use tello_shared::codec::parse_reading;
use tello_shared::{protocol, LinkError};

use crate::command::{CommandDispatcher, Outcome};

/// Why the pre-flight check stopped the flight
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PreflightFailure {
    #[error("No usable battery reading (last reply {response:?})")]
    BatteryUnreadable { response: Option<String> },

    #[error("Battery at {percent}%, minimum is {min}%")]
    BatteryLow { percent: i64, min: i64 },

    #[error("Takeoff failed after {attempts} attempt(s)")]
    TakeoffFailed { attempts: u32 },

    #[error("Takeoff rejected by vehicle: {response:?}")]
    TakeoffRejected { response: String },

    #[error("No usable height reading (last reply {response:?})")]
    HeightUnreadable { response: Option<String> },

    #[error("Height {height} below minimum {min}")]
    TooLow { height: i64, min: i64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreflightReport {
    /// Airborne, stable and high enough
    Ready { battery: i64, height: i64 },
    Aborted(PreflightFailure),
}

/// Battery check, takeoff with retry, then altitude check.
///
/// Every abort leaves the vehicle with a land command issued: either by the
/// dispatcher after a failed command or here after a policy rejection.
pub async fn run<C: BrokerConnector>(
    dispatcher: &mut CommandDispatcher<C>,
) -> Result<PreflightReport, LinkError> {
    let config = dispatcher.config();
    info!("Running pre-flight check");

    let battery = match query(dispatcher, protocol::BATTERY_QUERY).await? {
        Ok(value) => value,
        Err(NoReading { response, landed }) => {
            let failure = PreflightFailure::BatteryUnreadable { response };
            return abort(dispatcher, failure, !landed).await;
        }
    };
    info!("Battery at {}%", battery);
    if battery < config.min_battery {
        let failure = PreflightFailure::BatteryLow {
            percent: battery,
            min: config.min_battery,
        };
        return abort(dispatcher, failure, true).await;
    }

    let max_attempts = config.max_takeoff_attempts.max(1);
    let mut attempts = 0;
    loop {
        attempts += 1;
        info!("Takeoff attempt {}/{}", attempts, max_attempts);

        // A failed attempt has already been followed by a land
        match dispatcher
            .execute(protocol::TAKEOFF, config.takeoff_timeout(), 1)
            .await?
        {
            Outcome::Succeeded { .. } => break,
            Outcome::Unrecoverable { response } => {
                let failure = PreflightFailure::TakeoffRejected { response };
                return abort(dispatcher, failure, false).await;
            }
            Outcome::Exhausted { .. } if attempts >= max_attempts => {
                let failure = PreflightFailure::TakeoffFailed { attempts };
                return abort(dispatcher, failure, false).await;
            }
            Outcome::Exhausted { .. } => {
                warn!("Takeoff attempt {} failed, retrying", attempts);
                dispatcher.idle(config.command_delay()).await?;
            }
        }
    }

    info!("Airborne, stabilizing for {:?}", config.stabilization_delay());
    dispatcher.idle(config.stabilization_delay()).await?;

    let height = match query(dispatcher, protocol::HEIGHT_QUERY).await? {
        Ok(value) => value,
        Err(NoReading { response, landed }) => {
            let failure = PreflightFailure::HeightUnreadable { response };
            return abort(dispatcher, failure, !landed).await;
        }
    };
    info!("Height {}", height);
    if height < config.min_height {
        let failure = PreflightFailure::TooLow {
            height,
            min: config.min_height,
        };
        return abort(dispatcher, failure, true).await;
    }

    info!("Pre-flight check passed");
    Ok(PreflightReport::Ready { battery, height })
}

/// A query that produced no usable number
struct NoReading {
    response: Option<String>,
    /// The query itself failed, so the dispatcher has already landed
    landed: bool,
}

/// Execute a numeric query
async fn query<C: BrokerConnector>(
    dispatcher: &mut CommandDispatcher<C>,
    command: &str,
) -> Result<Result<i64, NoReading>, LinkError> {
    let config = dispatcher.config();
    let outcome = dispatcher
        .execute(command, config.command_timeout(), config.max_command_retries)
        .await?;

    let reading = match &outcome {
        Outcome::Succeeded { response } => parse_reading(response).ok(),
        _ => None,
    };

    Ok(reading.ok_or_else(|| NoReading {
        response: outcome.response().map(str::to_string),
        landed: !outcome.is_success(),
    }))
}

async fn abort<C: BrokerConnector>(
    dispatcher: &mut CommandDispatcher<C>,
    failure: PreflightFailure,
    land: bool,
) -> Result<PreflightReport, LinkError> {
    warn!("Pre-flight aborted: {}", failure);
    if land {
        dispatcher.emergency_land().await?;
    }
    Ok(PreflightReport::Aborted(failure))
}
