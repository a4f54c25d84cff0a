//! Sensor forwarding loop: one task per robot.
//!
//! Drains the adapter's sensor stream, wraps each sample in a `sensor_data`
//! message for the robot's subscribers and hands the raw sample to the
//! persistence sink.  The sink publish is spawned so a slow sink cannot
//! back up the stream.

use std::sync::Arc;

use futures_util::StreamExt;
use robogate_hal::RobotAdapter;
use robogate_middleware::{Hub, PersistenceSink};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// Start forwarding `adapter`'s telemetry for `robot_id`.
///
/// The task ends when `cancel` fires or the sensor stream closes.
pub fn spawn_forwarder(
    robot_id: String,
    adapter: Arc<dyn RobotAdapter>,
    hub: Hub,
    sink: Arc<dyn PersistenceSink>,
    cancel: CancellationToken,
) -> JoinHandle<u64> {
    let mut stream = adapter.sensor_stream();
    tokio::spawn(async move {
        info!(robot_id = %robot_id, "sensor forwarding started");
        let mut forwarded = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => {
                    let Some(sample) = next else {
                        debug!(robot_id = %robot_id, "sensor stream closed");
                        break;
                    };
                    hub.broadcast_to_robot(&robot_id, sample.to_message());
                    forwarded += 1;

                    let sink = Arc::clone(&sink);
                    tokio::spawn(async move {
                        if let Err(e) = sink.publish_sensor_data(&sample).await {
                            trace!(robot_id = %sample.robot_id, topic = %sample.topic, error = %e, "sensor publish failed");
                        }
                    });
                }
            }
        }
        info!(robot_id = %robot_id, forwarded, "sensor forwarding stopped");
        forwarded
    })
}
