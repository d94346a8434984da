//! The host binary's side of the wire protocol, driven by hand.

use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::process::Command;

use fleet_host::{FrameReader, FrameWriter};
use fleet_types::{CorrelationId, HostMessage};

use crate::common::{Fixture, HOST_BIN};

async fn next<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> HostMessage {
    tokio::time::timeout(Duration::from_secs(30), reader.read_frame())
        .await
        .expect("host went quiet")
        .unwrap()
        .expect("host closed stdout")
}

#[tokio::test]
async fn host_speaks_the_protocol_on_stdio() {
    let fixture = Fixture::new();
    let mut child = Command::new(HOST_BIN)
        .env("FLEET_CONFIG", &fixture.config)
        .env("FLEET_CONTEXT_CONCURRENCY", "2")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
        .unwrap();

    let mut reader = FrameReader::new(child.stdout.take().unwrap());
    let mut writer = FrameWriter::new(child.stdin.take().unwrap());
    assert_eq!(next(&mut reader).await, HostMessage::Ready);

    for id in ["first", "second"] {
        writer
            .write_frame(&HostMessage::RunTask {
                task: fixture.task(&format!("{id}.test")),
                correlation_id: CorrelationId::from_wire(id),
            })
            .await
            .unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..2 {
        match next(&mut reader).await {
            HostMessage::RunTaskResult {
                correlation_id,
                result,
            } => {
                assert!(result.test_file_path.ends_with(&format!("{correlation_id}.test")));
                seen.push(correlation_id.as_str().to_string());
            }
            other => panic!("unexpected {}", other.kind()),
        }
    }
    seen.sort();
    assert_eq!(seen, vec!["first", "second"]);

    writer.write_frame(&HostMessage::InitWindow).await.unwrap();
    assert_eq!(next(&mut reader).await, HostMessage::InitWindowEnd);

    drop(writer);
    let status = tokio::time::timeout(Duration::from_secs(30), child.wait())
        .await
        .expect("host did not exit after stdin closed")
        .unwrap();
    assert!(status.success());
}
