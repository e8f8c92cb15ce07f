use std::time::Duration;

use anyhow::{Result, bail};
use beamsim::{ServerBuilder, ServerHandle, catalog};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    time::timeout,
};

/// A raw line-protocol client against a local server.
struct TestClient {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl TestClient {
    async fn connect(port: u16) -> Result<TestClient> {
        let stream = TcpStream::connect(("127.0.0.1", port)).await?;
        let (reader, writer) = stream.into_split();
        Ok(TestClient {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = timeout(Duration::from_secs(5), self.reader.read_line(&mut line)).await??;
        if n == 0 {
            bail!("connection closed by server");
        }
        Ok(line.trim_end().to_string())
    }

    async fn round_trip(&mut self, request: &str) -> Result<String> {
        self.send(request).await?;
        self.recv().await
    }

    /// Read lines until a non-DATA response arrives, returning it and
    /// the number of DATA lines skipped.
    async fn recv_skipping_data(&mut self) -> Result<(String, usize)> {
        let mut skipped = 0;
        loop {
            let line = self.recv().await?;
            if line.starts_with("DATA:") {
                skipped += 1;
                continue;
            }
            return Ok((line, skipped));
        }
    }
}

async fn start_server() -> ServerHandle {
    ServerBuilder::new(catalog::beamline())
        .port(0)
        .tick_period(Duration::from_millis(5))
        .start()
        .await
        .unwrap()
}

#[tokio::test]
async fn ping_is_idempotent() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    assert_eq!(client.round_trip("PING").await.unwrap(), "OK:PONG");
    assert_eq!(client.round_trip("PING").await.unwrap(), "OK:PONG");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn put_then_get_round_trips() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    assert_eq!(
        client.round_trip("PUT:BL02:MONO:ENERGY:7112").await.unwrap(),
        "OK:PUT"
    );
    assert_eq!(
        client.round_trip("GET:BL02:MONO:ENERGY").await.unwrap(),
        "OK:7112"
    );
    // The monochromator readback follows the setpoint immediately.
    assert_eq!(
        client.round_trip("GET:BL02:MONO:ENERGY.RBV").await.unwrap(),
        "OK:7112"
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn writes_out_of_range_or_read_only_are_rejected() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    assert_eq!(
        client.round_trip("PUT:BL02:MONO:ENERGY:50000").await.unwrap(),
        "ERR:INVALID_VALUE"
    );
    assert_eq!(
        client.round_trip("PUT:BL02:RING:CURRENT:100").await.unwrap(),
        "ERR:INVALID_VALUE"
    );
    assert_eq!(
        client.round_trip("PUT:BL02:NOPE:1").await.unwrap(),
        "ERR:UNKNOWN_PV"
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn motor_moves_then_settles() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    assert_eq!(
        client.round_trip("MOVE:BL02:SAMPLE:X:500").await.unwrap(),
        "OK:MOVING"
    );
    assert_eq!(
        client.round_trip("STATUS:BL02:SAMPLE:X").await.unwrap(),
        "OK:MOVING"
    );

    // 500 units at 1000 units/s: give it a second to be safe.
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert_eq!(
        client.round_trip("STATUS:BL02:SAMPLE:X").await.unwrap(),
        "OK:IDLE"
    );
    assert_eq!(
        client.round_trip("GET:BL02:SAMPLE:X.RBV").await.unwrap(),
        "OK:500"
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn unknown_targets_are_reported() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    assert_eq!(client.round_trip("GET:NOPE").await.unwrap(), "ERR:UNKNOWN_PV");
    assert_eq!(
        client.round_trip("STATUS:NOPE").await.unwrap(),
        "ERR:UNKNOWN_PV"
    );
    // A readback is a PV but not a motor.
    assert_eq!(
        client.round_trip("STATUS:BL02:SAMPLE:X.RBV").await.unwrap(),
        "ERR:UNKNOWN_PV"
    );
    // MOVE reports unknown motors as invalid values.
    assert_eq!(
        client.round_trip("MOVE:NOPE:10").await.unwrap(),
        "ERR:INVALID_VALUE"
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn malformed_requests_keep_the_session_alive() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    assert_eq!(client.round_trip("FROB").await.unwrap(), "ERR:UNKNOWN_CMD");
    assert_eq!(
        client.round_trip("PUT:BL02:MONO:ENERGY:abc").await.unwrap(),
        "ERR:UNKNOWN_CMD"
    );
    assert_eq!(client.round_trip("PUT:NOVALUE").await.unwrap(), "ERR:UNKNOWN_CMD");
    // The session still works afterwards.
    assert_eq!(client.round_trip("PING").await.unwrap(), "OK:PONG");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn list_supports_glob_patterns() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    let all = client.round_trip("LIST").await.unwrap();
    let names: Vec<&str> = all.strip_prefix("OK:").unwrap().split(',').collect();
    assert_eq!(names.len(), 23);
    assert_eq!(names[0], "BL02:RING:CURRENT");
    assert!(names.contains(&"BL02:SAMPLE:X.DMOV"));

    assert_eq!(
        client.round_trip("LIST:BL02:DET:*").await.unwrap(),
        "OK:BL02:DET:I0,BL02:DET:IT,BL02:DET:IF"
    );
    // No matches collapses to a bare OK.
    assert_eq!(client.round_trip("LIST:NOMATCH*").await.unwrap(), "OK");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn monitor_pushes_until_stopped() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    assert_eq!(
        client.round_trip("MONITOR:BL02:DET:I0:50").await.unwrap(),
        "OK:MONITORING"
    );

    // Over 300 ms at a 50 ms cadence at least a few pushes must land.
    tokio::time::sleep(Duration::from_millis(300)).await;
    client.send("STOP").await.unwrap();
    let (reply, pushes) = client.recv_skipping_data().await.unwrap();
    assert_eq!(reply, "OK:STOPPED");
    assert!(pushes >= 3, "expected at least 3 pushes, got {pushes}");

    // After STOP, no further pushes arrive.
    let quiet = timeout(Duration::from_millis(200), client.recv()).await;
    assert!(quiet.is_err(), "unexpected traffic after STOP: {quiet:?}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn monitor_of_missing_pv_is_silent() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    assert_eq!(
        client.round_trip("MONITOR:NOPE:20").await.unwrap(),
        "OK:MONITORING"
    );
    let quiet = timeout(Duration::from_millis(200), client.recv()).await;
    assert!(quiet.is_err(), "push for a missing PV: {quiet:?}");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn a_new_monitor_replaces_the_previous_one() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    assert_eq!(
        client.round_trip("MONITOR:BL02:DET:I0:500").await.unwrap(),
        "OK:MONITORING"
    );
    assert_eq!(
        client.round_trip("MONITOR:BL02:HUTCH:TEMP:50").await.unwrap(),
        "OK:MONITORING"
    );

    tokio::time::sleep(Duration::from_millis(200)).await;
    client.send("STOP").await.unwrap();
    let (reply, pushes) = client.recv_skipping_data().await.unwrap();
    assert_eq!(reply, "OK:STOPPED");
    // The 500 ms subscription alone could not have pushed yet.
    assert!(pushes >= 2, "expected pushes from the replacement monitor");
    let temp = server.registry().lock().unwrap().get("BL02:HUTCH:TEMP");
    assert!(temp.is_some());

    server.stop().await.unwrap();
}

#[tokio::test]
async fn quit_closes_the_session() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    assert_eq!(client.round_trip("QUIT").await.unwrap(), "OK:BYE");
    let mut rest = String::new();
    let n = timeout(Duration::from_secs(5), client.reader.read_line(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "server should close after BYE");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn sessions_do_not_leak_writes_across_pvs() {
    let server = start_server().await;
    let mut alice = TestClient::connect(server.local_port()).await.unwrap();
    let mut bob = TestClient::connect(server.local_port()).await.unwrap();

    assert_eq!(
        alice.round_trip("PUT:BL02:SAMPLE:X:250").await.unwrap(),
        "OK:PUT"
    );
    assert_eq!(
        bob.round_trip("PUT:BL02:SAMPLE:Y:-250").await.unwrap(),
        "OK:PUT"
    );
    assert_eq!(
        alice.round_trip("GET:BL02:SAMPLE:X").await.unwrap(),
        "OK:250"
    );
    assert_eq!(
        bob.round_trip("GET:BL02:SAMPLE:Y").await.unwrap(),
        "OK:-250"
    );
    // Each session also observes the other's committed write.
    assert_eq!(
        alice.round_trip("GET:BL02:SAMPLE:Y").await.unwrap(),
        "OK:-250"
    );

    server.stop().await.unwrap();
}

#[tokio::test]
async fn excess_connections_are_closed_immediately() {
    let server = ServerBuilder::new(catalog::beamline())
        .port(0)
        .max_clients(2)
        .start()
        .await
        .unwrap();

    let mut first = TestClient::connect(server.local_port()).await.unwrap();
    let mut second = TestClient::connect(server.local_port()).await.unwrap();
    assert_eq!(first.round_trip("PING").await.unwrap(), "OK:PONG");
    assert_eq!(second.round_trip("PING").await.unwrap(), "OK:PONG");

    let mut third = TestClient::connect(server.local_port()).await.unwrap();
    let mut line = String::new();
    let n = timeout(Duration::from_secs(5), third.reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "over-capacity connection should be closed unanswered");

    // Existing sessions are unaffected.
    assert_eq!(first.round_trip("PING").await.unwrap(), "OK:PONG");

    // A freed slot becomes available again.
    assert_eq!(second.round_trip("QUIT").await.unwrap(), "OK:BYE");
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut fourth = TestClient::connect(server.local_port()).await.unwrap();
    assert_eq!(fourth.round_trip("PING").await.unwrap(), "OK:PONG");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn overlong_unterminated_line_drops_the_session() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    let flood = vec![b'A'; 4096];
    client.writer.write_all(&flood).await.unwrap();

    let mut line = String::new();
    let n = timeout(Duration::from_secs(5), client.reader.read_line(&mut line))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0, "server should disconnect a flooding client");

    server.stop().await.unwrap();
}

#[tokio::test]
async fn sensors_tick_while_idle() {
    let server = start_server().await;
    let mut client = TestClient::connect(server.local_port()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    let reply = client.round_trip("GET:BL02:RING:CURRENT").await.unwrap();
    let value: f64 = reply.strip_prefix("OK:").unwrap().parse().unwrap();
    assert!((348.0..352.0).contains(&value), "ring current was {value}");

    server.stop().await.unwrap();
}
