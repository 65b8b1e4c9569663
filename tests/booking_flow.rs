use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use rentd::payment::SandboxMode;
use rentd::tenant::AgencyManager;
use rentd::wire;

// ── Test infrastructure ──────────────────────────────────────

async fn start_test_server(mode: SandboxMode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("rentd_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    let agencies = Arc::new(AgencyManager::new(dir, 1000, None, "usd".into(), mode));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let agencies = agencies.clone();
            tokio::spawn(async move {
                let _ =
                    wire::process_connection(socket, agencies, "rentd".to_string(), None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("test")
        .user("rentd")
        .password("rentd");

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

fn data_rows(messages: &[SimpleQueryMessage]) -> Vec<&SimpleQueryRow> {
    messages
        .iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(r) => Some(r),
            _ => None,
        })
        .collect()
}

fn error_code(err: &tokio_postgres::Error) -> String {
    err.code()
        .map(|c| c.code().to_string())
        .unwrap_or_else(|| "<none>".into())
}

async fn reservation_status(client: &tokio_postgres::Client, rid: &Ulid) -> String {
    let rows = client
        .simple_query(&format!("SELECT * FROM reservations WHERE id = '{rid}'"))
        .await
        .unwrap();
    data_rows(&rows)[0].get("status").unwrap().to_string()
}

/// Wait until the reservation reaches `expect` (payment verdicts arrive
/// asynchronously). Returns the final observed status.
async fn wait_for_status(client: &tokio_postgres::Client, rid: &Ulid, expect: &str) -> String {
    let mut last = String::new();
    for _ in 0..100 {
        last = reservation_status(client, rid).await;
        if last == expect {
            return last;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    last
}

async fn wait_for_payment_status(
    client: &tokio_postgres::Client,
    rid: &Ulid,
    expect: &str,
) -> String {
    let mut last = String::new();
    for _ in 0..100 {
        let rows = client
            .simple_query(&format!("SELECT * FROM payments WHERE reservation_id = '{rid}'"))
            .await
            .unwrap();
        if let Some(row) = data_rows(&rows).first() {
            last = row.get("status").unwrap().to_string();
            if last == expect {
                return last;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    last
}

const DAY: i64 = 86_400_000;
const JAN1: i64 = 1_704_067_200_000;
const JAN2: i64 = JAN1 + DAY;
const JAN3: i64 = JAN1 + 2 * DAY;
const JAN4: i64 = JAN1 + 3 * DAY;

async fn create_vehicle(client: &tokio_postgres::Client, rate: &str) -> Ulid {
    let vid = Ulid::new();
    client
        .simple_query(&format!(
            "INSERT INTO vehicles (id, name, rate_per_day, available) VALUES ('{vid}', 'Test Car', {rate}, true)"
        ))
        .await
        .unwrap();
    vid
}

async fn create_reservation(
    client: &tokio_postgres::Client,
    vid: &Ulid,
    holder: &str,
    start: i64,
    end: i64,
) -> Ulid {
    let rid = Ulid::new();
    client
        .simple_query(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, holder, start, "end") VALUES ('{rid}', '{vid}', '{holder}', {start}, {end})"#
        ))
        .await
        .unwrap();
    rid
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn vehicle_catalog_roundtrip() {
    let addr = start_test_server(SandboxMode::Approve).await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, "45.50").await;

    let rows = client.simple_query("SELECT * FROM vehicles").await.unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("id").unwrap(), vid.to_string());
    assert_eq!(rows[0].get("name").unwrap(), "Test Car");
    assert_eq!(rows[0].get("rate_per_day").unwrap(), "45.50");
    assert_eq!(rows[0].get("available").unwrap(), "t");

    // Kill-switch flip
    client
        .simple_query(&format!("UPDATE vehicles SET available = false WHERE id = '{vid}'"))
        .await
        .unwrap();
    let rows = client.simple_query("SELECT * FROM vehicles").await.unwrap();
    assert_eq!(data_rows(&rows)[0].get("available").unwrap(), "f");

    // Disabled vehicle refuses bookings
    let rid = Ulid::new();
    let err = client
        .simple_query(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, holder, start, "end") VALUES ('{rid}', '{vid}', 'alice', {JAN1}, {JAN2})"#
        ))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "RV003");
}

#[tokio::test]
async fn create_returning_row_carries_price_and_status() {
    let addr = start_test_server(SandboxMode::Approve).await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, "30").await;
    let rid = Ulid::new();
    let rows = client
        .simple_query(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, holder, start, "end") VALUES ('{rid}', '{vid}', 'alice', {JAN1}, {JAN3}) RETURNING *"#
        ))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("status").unwrap(), "pending");
    assert_eq!(rows[0].get("total_price").unwrap(), "60");
    assert_eq!(rows[0].get("holder").unwrap(), "alice");
}

#[tokio::test]
async fn booking_conflict_cancel_rebook() {
    let addr = start_test_server(SandboxMode::Approve).await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, "30").await;
    let first = create_reservation(&client, &vid, "alice", JAN1, JAN3).await;

    // Overlapping request gets the exclusion-violation code
    let second = Ulid::new();
    let err = client
        .simple_query(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, holder, start, "end") VALUES ('{second}', '{vid}', 'bob', {JAN2}, {JAN4})"#
        ))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "23P01");

    // Adjacent request is fine
    create_reservation(&client, &vid, "carol", JAN3, JAN4).await;

    // Cancel the first, then the same overlapping request succeeds
    client
        .simple_query(&format!(
            "UPDATE reservations SET status = 'cancelled' WHERE id = '{first}'"
        ))
        .await
        .unwrap();
    client
        .simple_query(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, holder, start, "end") VALUES ('{second}', '{vid}', 'bob', {JAN1}, {JAN3})"#
        ))
        .await
        .unwrap();
    assert_eq!(reservation_status(&client, &second).await, "pending");
}

#[tokio::test]
async fn availability_busy_and_free_slots() {
    let addr = start_test_server(SandboxMode::Approve).await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, "30").await;
    create_reservation(&client, &vid, "alice", JAN2, JAN3).await;

    // Occupied window
    let rows = client
        .simple_query(&format!(
            "SELECT * FROM availability WHERE vehicle_id = '{vid}' AND start >= {JAN2} AND \"end\" <= {JAN3}"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&rows)[0].get("available").unwrap(), "f");

    // Free window
    let rows = client
        .simple_query(&format!(
            "SELECT * FROM availability WHERE vehicle_id = '{vid}' AND start >= {JAN3} AND \"end\" <= {JAN4}"
        ))
        .await
        .unwrap();
    assert_eq!(data_rows(&rows)[0].get("available").unwrap(), "t");

    // Busy list has the single active reservation
    let rows = client
        .simple_query(&format!("SELECT * FROM reservations WHERE vehicle_id = '{vid}'"))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("start").unwrap(), JAN2.to_string());
    assert_eq!(rows[0].get("end").unwrap(), JAN3.to_string());

    // Free slots around it
    let rows = client
        .simple_query(&format!(
            "SELECT * FROM free_slots WHERE vehicle_id = '{vid}' AND start >= {JAN1} AND \"end\" <= {JAN4}"
        ))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].get("start").unwrap(), JAN1.to_string());
    assert_eq!(rows[0].get("end").unwrap(), JAN2.to_string());
    assert_eq!(rows[1].get("start").unwrap(), JAN3.to_string());
    assert_eq!(rows[1].get("end").unwrap(), JAN4.to_string());

    // Quote preview
    let rows = client
        .simple_query(&format!(
            "SELECT * FROM quotes WHERE vehicle_id = '{vid}' AND start >= {JAN1} AND \"end\" <= {JAN3}"
        ))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows[0].get("days").unwrap(), "2");
    assert_eq!(rows[0].get("total_price").unwrap(), "60");
}

#[tokio::test]
async fn error_codes_are_distinct() {
    let addr = start_test_server(SandboxMode::Approve).await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, "30").await;

    // Invalid interval
    let rid = Ulid::new();
    let err = client
        .simple_query(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, holder, start, "end") VALUES ('{rid}', '{vid}', 'alice', {JAN2}, {JAN1})"#
        ))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "RV001");

    // Unknown vehicle
    let ghost = Ulid::new();
    let err = client
        .simple_query(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, holder, start, "end") VALUES ('{rid}', '{ghost}', 'alice', {JAN1}, {JAN2})"#
        ))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "RV002");

    // Unknown reservation
    let err = client
        .simple_query(&format!(
            "UPDATE reservations SET status = 'confirmed' WHERE id = '{ghost}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "RV006");

    // Illegal transition: pending → completed
    let pending = create_reservation(&client, &vid, "alice", JAN1, JAN2).await;
    let err = client
        .simple_query(&format!(
            "UPDATE reservations SET status = 'completed' WHERE id = '{pending}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "RV005");

    // Duplicate vehicle id
    let err = client
        .simple_query(&format!(
            "INSERT INTO vehicles (id, rate_per_day) VALUES ('{vid}', 30)"
        ))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "23505");
}

#[tokio::test]
async fn admin_status_transitions() {
    let addr = start_test_server(SandboxMode::Approve).await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, "30").await;
    let rid = create_reservation(&client, &vid, "alice", JAN1, JAN2).await;

    client
        .simple_query(&format!(
            "UPDATE reservations SET status = 'confirmed' WHERE id = '{rid}'"
        ))
        .await
        .unwrap();
    assert_eq!(reservation_status(&client, &rid).await, "confirmed");

    client
        .simple_query(&format!(
            "UPDATE reservations SET status = 'completed' WHERE id = '{rid}'"
        ))
        .await
        .unwrap();
    assert_eq!(reservation_status(&client, &rid).await, "completed");

    // Terminal — cancelling now is refused
    let err = client
        .simple_query(&format!(
            "UPDATE reservations SET status = 'cancelled' WHERE id = '{rid}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "RV005");
}

#[tokio::test]
async fn sandbox_payment_confirms_reservation() {
    let addr = start_test_server(SandboxMode::Approve).await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, "30").await;
    let rid = create_reservation(&client, &vid, "alice", JAN1, JAN3).await;

    let rows = client
        .simple_query(&format!("INSERT INTO payments (reservation_id) VALUES ('{rid}')"))
        .await
        .unwrap();
    let rows = data_rows(&rows);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("amount").unwrap(), "60");
    assert_eq!(rows[0].get("currency").unwrap(), "usd");
    assert_eq!(rows[0].get("status").unwrap(), "pending");

    // The sandbox verdict lands asynchronously and confirms the reservation
    assert_eq!(wait_for_status(&client, &rid, "confirmed").await, "confirmed");
    assert_eq!(wait_for_payment_status(&client, &rid, "completed").await, "completed");

    let rows = client
        .simple_query(&format!("SELECT * FROM payments WHERE reservation_id = '{rid}'"))
        .await
        .unwrap();
    assert!(data_rows(&rows)[0].get("receipt_url").is_some());

    // Paying again is refused
    let err = client
        .simple_query(&format!("INSERT INTO payments (reservation_id) VALUES ('{rid}')"))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "RV008");
}

#[tokio::test]
async fn declined_payment_leaves_reservation_pending() {
    let addr = start_test_server(SandboxMode::Decline).await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, "30").await;
    let rid = create_reservation(&client, &vid, "alice", JAN1, JAN3).await;

    client
        .simple_query(&format!("INSERT INTO payments (reservation_id) VALUES ('{rid}')"))
        .await
        .unwrap();

    // Wait for the decline to be applied to the payment record
    assert_eq!(wait_for_payment_status(&client, &rid, "failed").await, "failed");

    // The reservation still holds its slot, pending a retry or cancellation
    assert_eq!(reservation_status(&client, &rid).await, "pending");
    let other = Ulid::new();
    let err = client
        .simple_query(&format!(
            r#"INSERT INTO reservations (id, vehicle_id, holder, start, "end") VALUES ('{other}', '{vid}', 'bob', {JAN2}, {JAN4})"#
        ))
        .await
        .unwrap_err();
    assert_eq!(error_code(&err), "23P01");
}

#[tokio::test]
async fn agencies_are_isolated_by_database_name() {
    let addr = start_test_server(SandboxMode::Approve).await;

    let client_a = connect(addr).await;
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("other_agency")
        .user("rentd")
        .password("rentd");
    let (client_b, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });

    create_vehicle(&client_a, "30").await;

    let rows = client_b.simple_query("SELECT * FROM vehicles").await.unwrap();
    assert!(data_rows(&rows).is_empty());
}

#[tokio::test]
async fn extended_protocol_binds_parameters() {
    let addr = start_test_server(SandboxMode::Approve).await;
    let client = connect(addr).await;

    let vid = create_vehicle(&client, "30").await;
    // Prepared statement through the extended protocol path
    let rows = client
        .query(
            "SELECT * FROM reservations WHERE vehicle_id = $1",
            &[&vid.to_string()],
        )
        .await
        .unwrap();
    assert!(rows.is_empty());
}
