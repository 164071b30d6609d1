use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use equiploan::tenant::TenantManager;
use equiploan::wire;

const PASSWORD: &str = "equiploan";
const SERVICE: &str = "equiploan";

// ── Test infrastructure ──────────────────────────────────────

fn test_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("equiploan_int_test_{}", Ulid::new()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

async fn start_test_server(dir: PathBuf) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let tm = Arc::new(TenantManager::new(dir, 1000));

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let tm = tm.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(
                    socket,
                    tm,
                    PASSWORD.to_string(),
                    SERVICE.to_string(),
                    None,
                )
                .await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, tenant: &str, user: &str) -> Client {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname(tenant)
        .user(user)
        .password(PASSWORD);

    let (client, connection) = config.connect(NoTls).await.unwrap();
    tokio::spawn(async move {
        let _ = connection.await;
    });
    client
}

async fn rows(client: &Client, sql: &str) -> Vec<SimpleQueryRow> {
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

fn sqlstate(e: &tokio_postgres::Error) -> String {
    e.as_db_error()
        .map(|db| db.code().code().to_string())
        .unwrap_or_default()
}

fn message(e: &tokio_postgres::Error) -> String {
    e.as_db_error()
        .map(|db| db.message().to_string())
        .unwrap_or_default()
}

/// `YYYY-MM-DD` for `n` days from today (UTC).
fn date_in(n: i64) -> String {
    (Utc::now() + TimeDelta::days(n)).format("%Y-%m-%d").to_string()
}

async fn register(admin: &Client, email: &str, role: &str) -> Ulid {
    let id = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO users (id, email, first_name, last_name, role) \
             VALUES ('{id}', '{email}', 'Ann', 'Lee', '{role}')"
        ))
        .await
        .unwrap();
    id
}

async fn add_equipment(admin: &Client, kind: &str, reference: &str) -> Ulid {
    let id = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO equipment (id, name, type, ref, description) \
             VALUES ('{id}', 'Demo unit', '{kind}', '{reference}', NULL)"
        ))
        .await
        .unwrap();
    id
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn service_account_manages_catalog() {
    let addr = start_test_server(test_dir()).await;
    let admin = connect(addr, "lab", SERVICE).await;

    let ann = register(&admin, "ann@example.com", "user").await;
    let phone = add_equipment(&admin, "phone", "IP16").await;

    let users = rows(&admin, "SELECT * FROM users").await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].get("id"), Some(ann.to_string().as_str()));
    assert_eq!(users[0].get("status"), Some("active"));

    let items = rows(&admin, &format!("SELECT * FROM equipment WHERE id = '{phone}'")).await;
    assert_eq!(items.len(), 1);
    assert!(items[0].get("ref").unwrap().starts_with("IP16-"));
    assert_eq!(items[0].get("image"), Some("phone.png"));
    assert_eq!(items[0].get("description"), None);

    admin
        .batch_execute(&format!(
            "UPDATE equipment SET status = 'unavailable' WHERE id = '{phone}'"
        ))
        .await
        .unwrap();
    let available = rows(&admin, "SELECT * FROM equipment WHERE status = 'available'").await;
    assert!(available.is_empty());
}

#[tokio::test]
async fn member_borrows_and_overlap_is_rejected() {
    let addr = start_test_server(test_dir()).await;
    let admin = connect(addr, "lab", SERVICE).await;
    let ann = register(&admin, "ann@example.com", "user").await;
    register(&admin, "bob@example.com", "user").await;
    let phone = add_equipment(&admin, "phone", "IP16").await;

    let ann_client = connect(addr, "lab", "ann@example.com").await;
    let loan = Ulid::new();
    ann_client
        .batch_execute(&format!(
            "INSERT INTO loans (id, equipment_id, borrow_date, return_date) \
             VALUES ('{loan}', '{phone}', '{}', '{}')",
            date_in(1),
            date_in(3)
        ))
        .await
        .unwrap();

    let mine = rows(&ann_client, &format!("SELECT * FROM loans WHERE user_id = '{ann}'")).await;
    assert_eq!(mine.len(), 1);
    assert_eq!(mine[0].get("id"), Some(loan.to_string().as_str()));

    // Touching on the last day still conflicts.
    let bob_client = connect(addr, "lab", "bob@example.com").await;
    let err = bob_client
        .batch_execute(&format!(
            "INSERT INTO loans (id, equipment_id, borrow_date, return_date) \
             VALUES ('{}', '{phone}', '{}', '{}')",
            Ulid::new(),
            date_in(3),
            date_in(5)
        ))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0001");
    assert_eq!(message(&err), "Equipment is already on loan during this period.");

    bob_client
        .batch_execute(&format!(
            "INSERT INTO loans (id, equipment_id, borrow_date, return_date) \
             VALUES ('{}', '{phone}', '{}', '{}')",
            Ulid::new(),
            date_in(4),
            date_in(5)
        ))
        .await
        .unwrap();

    let on_phone =
        rows(&bob_client, &format!("SELECT * FROM loans WHERE equipment_id = '{phone}'")).await;
    assert_eq!(on_phone.len(), 2);
}

#[tokio::test]
async fn borrowing_policy_messages() {
    let addr = start_test_server(test_dir()).await;
    let admin = connect(addr, "lab", SERVICE).await;
    register(&admin, "ann@example.com", "user").await;
    let phone = add_equipment(&admin, "phone", "IP16").await;
    let ann = connect(addr, "lab", "ann@example.com").await;

    let cases = [
        ("NULL".to_string(), format!("'{}'", date_in(2)), "Please provide both start and end dates."),
        (format!("'{}'", date_in(-2)), format!("'{}'", date_in(2)), "The start date cannot be in the past."),
        (format!("'{}'", date_in(5)), format!("'{}'", date_in(2)), "The end date must be after the start date."),
        (format!("'{}'", date_in(1)), format!("'{}'", date_in(250)), "The borrowing period must not exceed 6 months."),
    ];
    for (start, end, expected) in cases {
        let err = ann
            .batch_execute(&format!(
                "INSERT INTO loans (id, equipment_id, borrow_date, return_date) \
                 VALUES ('{}', '{phone}', {start}, {end})",
                Ulid::new()
            ))
            .await
            .unwrap_err();
        assert_eq!(message(&err), expected);
    }
    assert!(rows(&admin, "SELECT * FROM loans").await.is_empty());
}

#[tokio::test]
async fn members_are_limited_to_their_own_records() {
    let addr = start_test_server(test_dir()).await;
    let admin = connect(addr, "lab", SERVICE).await;
    let ann = register(&admin, "ann@example.com", "user").await;
    let bob = register(&admin, "bob@example.com", "user").await;
    add_equipment(&admin, "laptop", "MBP").await;

    let client = connect(addr, "lab", "ann@example.com").await;
    let err = client.simple_query("SELECT * FROM users").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let err = client
        .simple_query(&format!("SELECT * FROM loans WHERE user_id = '{bob}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    let profile = rows(&client, "SELECT * FROM profile").await;
    assert_eq!(profile.len(), 1);
    assert_eq!(profile[0].get("id"), Some(ann.to_string().as_str()));

    client
        .batch_execute(&format!("UPDATE users SET first_name = 'Annie' WHERE id = '{ann}'"))
        .await
        .unwrap();
    let err = client
        .batch_execute(&format!("UPDATE users SET role = 'admin' WHERE id = '{ann}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "42501");

    // The catalog is public.
    assert_eq!(rows(&client, "SELECT * FROM equipment").await.len(), 1);
}

#[tokio::test]
async fn unknown_and_deactivated_logins_are_refused() {
    let addr = start_test_server(test_dir()).await;
    let admin = connect(addr, "lab", SERVICE).await;
    let ann = register(&admin, "ann@example.com", "user").await;

    let stranger = connect(addr, "lab", "nobody@example.com").await;
    let err = stranger.simple_query("SELECT * FROM equipment").await.unwrap_err();
    assert_eq!(sqlstate(&err), "28000");

    admin
        .batch_execute(&format!("UPDATE users SET status = 'inactive' WHERE id = '{ann}'"))
        .await
        .unwrap();
    let client = connect(addr, "lab", "ann@example.com").await;
    let err = client.simple_query("SELECT * FROM profile").await.unwrap_err();
    assert_eq!(sqlstate(&err), "28000");
}

#[tokio::test]
async fn delete_user_with_loans_needs_force() {
    let addr = start_test_server(test_dir()).await;
    let admin = connect(addr, "lab", SERVICE).await;
    let ann = register(&admin, "ann@example.com", "user").await;
    let phone = add_equipment(&admin, "phone", "IP16").await;
    admin
        .batch_execute(&format!(
            "INSERT INTO loans (id, equipment_id, borrow_date, return_date, user_id) \
             VALUES ('{}', '{phone}', '{}', '{}', '{ann}')",
            Ulid::new(),
            date_in(0),
            date_in(2)
        ))
        .await
        .unwrap();

    let err = admin
        .batch_execute(&format!("DELETE FROM users WHERE id = '{ann}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0001");

    admin
        .batch_execute(&format!("DELETE FROM users WHERE id = '{ann}' AND force = true"))
        .await
        .unwrap();
    assert!(rows(&admin, "SELECT * FROM loans").await.is_empty());

    let err = admin
        .batch_execute(&format!("DELETE FROM users WHERE id = '{ann}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), "P0002");
}

#[tokio::test]
async fn tenants_are_isolated() {
    let addr = start_test_server(test_dir()).await;
    let lab = connect(addr, "lab", SERVICE).await;
    let office = connect(addr, "office", SERVICE).await;

    register(&lab, "ann@example.com", "user").await;
    register(&office, "ann@example.com", "admin").await;
    add_equipment(&lab, "mouse", "MS").await;

    assert_eq!(rows(&lab, "SELECT * FROM equipment").await.len(), 1);
    assert!(rows(&office, "SELECT * FROM equipment").await.is_empty());
    let office_users = rows(&office, "SELECT * FROM users").await;
    assert_eq!(office_users[0].get("role"), Some("admin"));
}

#[tokio::test]
async fn state_survives_restart() {
    let dir = test_dir();
    let phone;
    {
        let addr = start_test_server(dir.clone()).await;
        let admin = connect(addr, "lab", SERVICE).await;
        let ann = register(&admin, "ann@example.com", "user").await;
        phone = add_equipment(&admin, "phone", "IP16").await;
        admin
            .batch_execute(&format!(
                "INSERT INTO loans (id, equipment_id, borrow_date, return_date, user_id) \
                 VALUES ('{}', '{phone}', '{}', '{}', '{ann}')",
                Ulid::new(),
                date_in(1),
                date_in(1)
            ))
            .await
            .unwrap();
    }

    let addr = start_test_server(dir).await;
    let admin = connect(addr, "lab", SERVICE).await;
    assert_eq!(rows(&admin, "SELECT * FROM users").await.len(), 1);
    let loans = rows(&admin, &format!("SELECT * FROM loans WHERE equipment_id = '{phone}'")).await;
    assert_eq!(loans.len(), 1);
}

#[tokio::test]
async fn syntax_errors_are_reported() {
    let addr = start_test_server(test_dir()).await;
    let admin = connect(addr, "lab", SERVICE).await;
    let err = admin.simple_query("SELEC nonsense").await.unwrap_err();
    assert_eq!(sqlstate(&err), "42601");
}
