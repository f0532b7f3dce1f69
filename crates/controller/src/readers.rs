//! Parsers for modeller-written source payloads.

use modelsync_core::{CameraObserver, CameraSample, NetworkStatus, StatusObserver};
use modelsync_net::{parse_fragment, Element, ProtocolDecodeError};
use std::sync::Arc;

use crate::session::SourceHandler;

/// One network status record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRecord {
    /// Reported status.
    pub status: NetworkStatus,
    /// Network the status refers to.
    pub network_id: u32,
}

/// Parse every complete status record in `payload`.
///
/// Records missing a field or carrying an unknown value are logged and skipped.
pub fn parse_status(payload: &str) -> Result<Vec<StatusRecord>, ProtocolDecodeError> {
    let roots = parse_fragment(payload)?;
    Ok(roots.iter().filter_map(status_record).collect())
}

fn status_record(root: &Element) -> Option<StatusRecord> {
    let status = match root.child_text("Network_Status")?.parse::<NetworkStatus>() {
        Ok(status) => status,
        Err(err) => {
            tracing::warn!(%err, "Skipping status record");
            return None;
        }
    };
    let Some(network_id) = root
        .child_text("Network_ID")
        .and_then(|raw| raw.parse::<u32>().ok())
    else {
        tracing::warn!(%status, "Skipping status record without a numeric network id");
        return None;
    };
    Some(StatusRecord { status, network_id })
}

/// Parse every complete camera record in `payload`.
pub fn parse_cameras(payload: &str) -> Result<Vec<CameraSample>, ProtocolDecodeError> {
    let roots = parse_fragment(payload)?;
    Ok(roots
        .iter()
        .flat_map(|root| root.children_named("Camera"))
        .filter_map(camera_sample)
        .collect())
}

fn camera_sample(camera: &Element) -> Option<CameraSample> {
    let speed = |name: &str| camera.child_text(name)?.parse::<f64>().ok();
    match (camera.child_text("ID"), speed("Speed_NE"), speed("Speed_SW")) {
        (Some(id), Some(speed_ne), Some(speed_sw)) if !id.is_empty() => Some(CameraSample {
            camera_id: id.to_string(),
            speed_ne,
            speed_sw,
        }),
        _ => {
            tracing::warn!(camera = ?camera.child_text("ID"), "Skipping incomplete camera record");
            None
        }
    }
}

/// Routes status payloads to a [`StatusObserver`].
pub struct StatusReader {
    observer: Arc<dyn StatusObserver>,
}

impl StatusReader {
    /// Reader notifying `observer`.
    pub fn new(observer: Arc<dyn StatusObserver>) -> Self {
        Self { observer }
    }
}

impl SourceHandler for StatusReader {
    fn on_payload(&self, payload: &str) {
        if payload.trim().is_empty() {
            return;
        }
        match parse_status(payload) {
            Ok(records) => {
                for record in records {
                    tracing::debug!(status = %record.status, network = record.network_id, "Network status");
                    self.observer.on_network_status(record.status, record.network_id);
                }
            }
            Err(err) => tracing::warn!(%err, "Discarding malformed status payload"),
        }
    }
}

/// Routes camera payloads to a [`CameraObserver`].
pub struct CameraReader {
    observer: Arc<dyn CameraObserver>,
}

impl CameraReader {
    /// Reader notifying `observer`.
    pub fn new(observer: Arc<dyn CameraObserver>) -> Self {
        Self { observer }
    }
}

impl SourceHandler for CameraReader {
    fn on_payload(&self, payload: &str) {
        if payload.trim().is_empty() {
            return;
        }
        match parse_cameras(payload) {
            Ok(samples) => {
                for sample in samples {
                    self.observer.on_camera_speed_sample(sample);
                }
            }
            Err(err) => tracing::warn!(%err, "Discarding malformed camera payload"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use modelsync_testkit::Recorder;

    #[test]
    fn status_payload_yields_record() {
        let records = parse_status(
            "<Paramics><Network_Status>LOADED</Network_Status><Network_ID>7</Network_ID></Paramics>",
        )
        .expect("parses");
        assert_eq!(
            records,
            vec![StatusRecord {
                status: NetworkStatus::Loaded,
                network_id: 7,
            }]
        );
    }

    #[test]
    fn consecutive_status_documents_are_separate_records() {
        let payload = "<?xml version=\"1.0\"?>\
            <Paramics><Network_Status>Loading</Network_Status><Network_ID>3</Network_ID></Paramics>\n\
            <Paramics><Network_Status>WARMING</Network_Status><Network_ID>3</Network_ID></Paramics>";
        let statuses: Vec<_> = parse_status(payload)
            .expect("parses")
            .into_iter()
            .map(|record| record.status)
            .collect();
        assert_eq!(statuses, vec![NetworkStatus::Loading, NetworkStatus::Warming]);
    }

    #[test]
    fn incomplete_status_records_are_skipped() {
        let payload = "<Paramics><Network_Status>LOADED</Network_Status></Paramics>\
            <Paramics><Network_Status>EXPLODED</Network_Status><Network_ID>1</Network_ID></Paramics>\
            <Paramics><Network_Status>LOADED</Network_Status><Network_ID>x</Network_ID></Paramics>";
        assert!(parse_status(payload).expect("parses").is_empty());
    }

    #[test]
    fn camera_payload_yields_one_sample_per_complete_camera() {
        let payload = "<Paramics>\
            <Camera><ID>CAM-1</ID><Speed_NE>54.5</Speed_NE><Speed_SW>61</Speed_SW></Camera>\
            <Camera><ID>CAM-2</ID><Speed_NE>12</Speed_NE></Camera>\
            <Camera><ID>CAM-3</ID><Speed_NE>0</Speed_NE><Speed_SW>7.25</Speed_SW></Camera>\
            </Paramics>";
        let samples = parse_cameras(payload).expect("parses");
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].camera_id, "CAM-1");
        assert_eq!(samples[0].speed_ne, 54.5);
        assert_eq!(samples[1].speed_sw, 7.25);
    }

    #[test]
    fn readers_skip_empty_and_malformed_payloads() {
        let statuses: Recorder<(NetworkStatus, u32)> = Recorder::new();
        let sink = statuses.clone();
        let reader = StatusReader::new(Arc::new(move |status: NetworkStatus, id: u32| {
            sink.push((status, id))
        }));
        reader.on_payload("");
        reader.on_payload("   \n");
        reader.on_payload("<Paramics><Network_Status>");
        reader.on_payload(
            "<Paramics><Network_Status>WARMING</Network_Status><Network_ID>2</Network_ID></Paramics>",
        );
        assert_eq!(statuses.snapshot(), vec![(NetworkStatus::Warming, 2)]);

        let cameras: Recorder<CameraSample> = Recorder::new();
        let reader = CameraReader::new(Arc::new(cameras.callback()));
        reader.on_payload("not xml <");
        reader.on_payload(
            "<Paramics><Camera><ID>C</ID><Speed_NE>1</Speed_NE><Speed_SW>2</Speed_SW></Camera></Paramics>",
        );
        assert_eq!(cameras.len(), 1);
    }

    #[test]
    fn deeply_nested_payload_is_discarded() {
        let statuses: Recorder<(NetworkStatus, u32)> = Recorder::new();
        let sink = statuses.clone();
        let reader = StatusReader::new(Arc::new(move |status: NetworkStatus, id: u32| {
            sink.push((status, id))
        }));
        // Runs on a small stack, like the link reader thread.
        std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || {
                reader.on_payload(&"<a>".repeat(200_000));
                reader.on_payload(
                    "<Paramics><Network_Status>LOADED</Network_Status><Network_ID>4</Network_ID></Paramics>",
                );
            })
            .expect("spawn")
            .join()
            .expect("reader survives");
        assert_eq!(statuses.snapshot(), vec![(NetworkStatus::Loaded, 4)]);
    }
}
