use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_postgres::{Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use agenda::clock::FixedClock;
use agenda::config::ScheduleConfig;
use agenda::model::parse_instant;
use agenda::tenant::TenantManager;
use agenda::wire;

// ── Test infrastructure ──────────────────────────────────────

const DAY: &str = "2026-10-20";

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let dir = std::env::temp_dir().join(format!("agenda_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    // The evening before the test day, so every slot on it is in the future.
    let clock = Arc::new(FixedClock::new(parse_instant("2026-10-19T20:00:00Z").unwrap()));
    let tm = Arc::new(TenantManager::with_clock(
        dir,
        1000,
        ScheduleConfig::default(),
        clock,
    ));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, tm, "agenda".into(), "agenda".into(), None).await;
            });
        }
    });

    addr
}

async fn connect_as(addr: SocketAddr, user: &str, password: &str) -> Result<tokio_postgres::Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("salon")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn connect(addr: SocketAddr) -> tokio_postgres::Client {
    connect_as(addr, "agenda", "agenda").await.unwrap()
}

async fn rows(client: &tokio_postgres::Client, sql: &str) -> Vec<SimpleQueryRow> {
    client
        .simple_query(sql)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => Some(row),
            _ => None,
        })
        .collect()
}

fn sqlstate(err: &tokio_postgres::Error) -> String {
    err.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

/// Seed a service and a client; returns the client id.
async fn seed(client: &tokio_postgres::Client) -> Ulid {
    let client_id = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO services (name, price, duration) VALUES ('Corte', 80.00, 60);
             INSERT INTO clients (id, name) VALUES ('{client_id}', 'Ana')"
        ))
        .await
        .unwrap();
    client_id
}

async fn book(
    client: &tokio_postgres::Client,
    client_id: Ulid,
    start: &str,
) -> Result<Ulid, tokio_postgres::Error> {
    let id = Ulid::new();
    client
        .execute(
            "INSERT INTO appointments (id, client_id, start, service) VALUES ($1, $2, $3, $4)",
            &[&id.to_string(), &client_id.to_string(), &start, &"Corte"],
        )
        .await?;
    Ok(id)
}

fn slot<'a>(slots: &'a [SimpleQueryRow], time: &str) -> &'a SimpleQueryRow {
    slots
        .iter()
        .find(|r| r.get("time") == Some(time))
        .unwrap_or_else(|| panic!("no slot at {time}"))
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn booking_marks_slots_unavailable() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let client_id = seed(&client).await;

    book(&client, client_id, "2026-10-20T10:00:00Z").await.unwrap();

    let slots = rows(
        &client,
        &format!("SELECT * FROM slots WHERE service = 'Corte' AND date = '{DAY}'"),
    )
    .await;
    assert_eq!(slots.len(), 17);
    assert_eq!(slot(&slots, "09:00").get("available"), Some("t"));
    assert_eq!(slot(&slots, "09:30").get("available"), Some("f"));
    assert_eq!(slot(&slots, "10:00").get("available"), Some("f"));
    assert_eq!(slot(&slots, "10:00").get("reason"), Some("booked 10:00-11:00"));
    assert_eq!(slot(&slots, "10:00").get("start"), Some("2026-10-20T10:00:00+00:00"));
    assert_eq!(slot(&slots, "10:00").get("end"), Some("2026-10-20T11:00:00+00:00"));
    assert_eq!(slot(&slots, "11:00").get("available"), Some("t"));
}

#[tokio::test]
async fn overlapping_booking_is_rejected() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let client_id = seed(&client).await;

    book(&client, client_id, "2026-10-20T10:00:00Z").await.unwrap();
    let err = book(&client, client_id, "2026-10-20T10:30:00Z").await.unwrap_err();
    assert_eq!(sqlstate(&err), "23P01");

    // Adjacent is fine.
    book(&client, client_id, "2026-10-20T11:00:00Z").await.unwrap();

    let listed = rows(
        &client,
        &format!("SELECT * FROM appointments WHERE date = '{DAY}'"),
    )
    .await;
    assert_eq!(listed.len(), 2);
    let mut starts: Vec<_> = listed.iter().filter_map(|r| r.get("start")).collect();
    starts.sort();
    assert_eq!(starts, ["2026-10-20T10:00:00+00:00", "2026-10-20T11:00:00+00:00"]);
    assert_eq!(listed[0].get("end").map(|e| e.len()), Some(25));
}

#[tokio::test]
async fn completion_records_revenue_and_loyalty() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let client_id = seed(&client).await;
    let id = book(&client, client_id, "2026-10-20T14:00:00Z").await.unwrap();

    client
        .execute(
            "UPDATE appointments SET status = $1 WHERE id = $2",
            &[&"completed", &id.to_string()],
        )
        .await
        .unwrap();

    let tx = rows(
        &client,
        &format!("SELECT * FROM transactions WHERE appointment_id = '{id}'"),
    )
    .await;
    assert_eq!(tx.len(), 1);
    assert_eq!(tx[0].get("amount"), Some("80.00"));

    let loyalty = rows(
        &client,
        &format!("SELECT * FROM loyalty WHERE client_id = '{client_id}'"),
    )
    .await;
    assert_eq!(loyalty.len(), 1);
    assert_eq!(loyalty[0].get("points"), Some("70"));
    assert_eq!(loyalty[0].get("tier"), Some("Bronze"));
    assert_eq!(loyalty[0].get("next_threshold"), Some("100"));

    // A completed appointment cannot be cancelled.
    let err = client
        .batch_execute(&format!(
            "UPDATE appointments SET status = 'cancelled' WHERE id = '{id}'"
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "55000");
}

#[tokio::test]
async fn cancelled_slot_can_be_rebooked() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    let client_id = seed(&client).await;
    let id = book(&client, client_id, "2026-10-20T15:00:00Z").await.unwrap();

    client
        .batch_execute(&format!(
            "UPDATE appointments SET status = 'cancelado' WHERE id = '{id}'"
        ))
        .await
        .unwrap();
    book(&client, client_id, "2026-10-20T15:00:00Z").await.unwrap();

    let history = rows(
        &client,
        &format!("SELECT * FROM appointments WHERE client_id = '{client_id}'"),
    )
    .await;
    let statuses: Vec<_> = history.iter().filter_map(|r| r.get("status")).collect();
    assert_eq!(statuses.len(), 2);
    assert!(statuses.contains(&"cancelled"));
    assert!(statuses.contains(&"scheduled"));
}

#[tokio::test]
async fn unknown_client_and_bad_input_errors() {
    let addr = start_test_server().await;
    let client = connect(addr).await;
    seed(&client).await;

    let err = book(&client, Ulid::new(), "2026-10-20T10:00:00Z").await.unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");

    let err = client
        .batch_execute("SELECT * FROM slots WHERE service = 'Corte'")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42601");

    let err = client
        .batch_execute("SELECT * FROM rooms")
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42P01");
}

#[tokio::test]
async fn wrong_credentials_rejected() {
    let addr = start_test_server().await;
    assert!(connect_as(addr, "agenda", "wrong").await.is_err());
    assert!(connect_as(addr, "postgres", "agenda").await.is_err());
}
