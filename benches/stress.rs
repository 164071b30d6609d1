use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use tokio_postgres::{Config, NoTls};
use ulid::Ulid;

const DAY: i64 = 86_400_000; // 1 day in ms

fn today() -> i64 {
    let now = chrono::Utc::now().timestamp_millis();
    now - now.rem_euclid(DAY)
}

async fn connect(host: &str, port: u16, tenant: &str) -> tokio_postgres::Client {
    let user = std::env::var("EQUIPLOAN_SERVICE_USER").unwrap_or_else(|_| "equiploan".into());
    let password = std::env::var("EQUIPLOAN_PASSWORD").unwrap_or_else(|_| "equiploan".into());
    let mut config = Config::new();
    config
        .host(host)
        .port(port)
        .dbname(tenant)
        .user(&user)
        .password(&password);

    let (client, conn) = config.connect(NoTls).await.expect("connect failed");
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            eprintln!("connection error: {e}");
        }
    });
    client
}

fn fresh_tenant() -> String {
    format!("bench_{}", Ulid::new())
}

fn percentile(sorted: &[Duration], p: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let idx = ((sorted.len() as f64) * p / 100.0) as usize;
    sorted[idx.min(sorted.len() - 1)]
}

fn print_latency(label: &str, latencies: &mut [Duration]) {
    if latencies.is_empty() {
        println!("  {label}: no samples");
        return;
    }
    latencies.sort();
    let total: Duration = latencies.iter().sum();
    let avg = total / latencies.len() as u32;
    println!("  {label}:");
    println!(
        "    n={}, avg={:.2}ms, p50={:.2}ms, p95={:.2}ms, p99={:.2}ms, max={:.2}ms",
        latencies.len(),
        avg.as_secs_f64() * 1000.0,
        percentile(latencies, 50.0).as_secs_f64() * 1000.0,
        percentile(latencies, 95.0).as_secs_f64() * 1000.0,
        percentile(latencies, 99.0).as_secs_f64() * 1000.0,
        latencies[latencies.len() - 1].as_secs_f64() * 1000.0,
    );
}

async fn add_member(client: &tokio_postgres::Client, n: usize) -> Ulid {
    let uid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO users (id, email, first_name, last_name) \
             VALUES ('{uid}', 'member{n}@bench.local', 'Bench', 'Member{n}')"
        ))
        .await
        .unwrap();
    uid
}

async fn add_item(client: &tokio_postgres::Client) -> Ulid {
    let eid = Ulid::new();
    client
        .batch_execute(&format!(
            "INSERT INTO equipment (id, name, type, ref) VALUES ('{eid}', 'Bench phone', 'phone', 'BP')"
        ))
        .await
        .unwrap();
    eid
}

async fn borrow(
    client: &tokio_postgres::Client,
    eid: Ulid,
    uid: Ulid,
    start: i64,
    end: i64,
) -> Result<(), tokio_postgres::Error> {
    client
        .batch_execute(&format!(
            "INSERT INTO loans (id, equipment_id, borrow_date, return_date, user_id) \
             VALUES ('{}', '{eid}', {start}, {end}, '{uid}')",
            Ulid::new()
        ))
        .await
}

async fn phase1_sequential(host: &str, port: u16) {
    let client = connect(host, port, &fresh_tenant()).await;
    let uid = add_member(&client, 0).await;

    // One-day loans, back to back, across a handful of items.
    let items = 6;
    let days = 300;
    let mut eids = Vec::with_capacity(items);
    for _ in 0..items {
        eids.push(add_item(&client).await);
    }

    let base = today();
    let mut latencies = Vec::with_capacity(items * days);
    let start = Instant::now();
    for eid in &eids {
        for d in 0..days as i64 {
            let s = base + d * DAY;
            let t = Instant::now();
            borrow(&client, *eid, uid, s, s).await.unwrap();
            latencies.push(t.elapsed());
        }
    }

    let n = latencies.len();
    let elapsed = start.elapsed();
    let ops = n as f64 / elapsed.as_secs_f64();
    println!("  {n} loans in {:.2}s = {ops:.0} ops/sec", elapsed.as_secs_f64());
    print_latency("write latency", &mut latencies);
}

async fn phase2_contention(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let n_tasks = 20;
    let rounds = 50;
    let mut members = Vec::with_capacity(n_tasks);
    for i in 0..n_tasks {
        members.push(add_member(&setup, i).await);
    }
    let eid = add_item(&setup).await;

    // Every task asks for the same period each round; one should win.
    let won = Arc::new(AtomicUsize::new(0));
    let start = Instant::now();
    let mut handles = Vec::new();
    for uid in members {
        let host = host.to_string();
        let tenant = tenant.clone();
        let won = won.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let base = today();
            for r in 0..rounds {
                let s = base + r * 3 * DAY;
                if borrow(&client, eid, uid, s, s + DAY).await.is_ok() {
                    won.fetch_add(1, Ordering::Relaxed);
                }
            }
        }));
    }
    for h in handles {
        h.await.unwrap();
    }

    let elapsed = start.elapsed();
    let total = n_tasks as i64 * rounds;
    let won = won.load(Ordering::Relaxed);
    println!(
        "  {n_tasks} tasks x {rounds} rounds = {total} requests in {:.2}s, {won} accepted (expected {rounds})",
        elapsed.as_secs_f64()
    );
}

async fn phase3_read_under_load(host: &str, port: u16) {
    let tenant = fresh_tenant();
    let setup = connect(host, port, &tenant).await;
    let uid = add_member(&setup, 0).await;
    let mut eids = Vec::new();
    for _ in 0..50 {
        let eid = add_item(&setup).await;
        for d in 0..20 {
            let s = today() + d * 2 * DAY;
            borrow(&setup, eid, uid, s, s).await.unwrap();
        }
        eids.push(eid);
    }
    drop(setup);

    // Writers keep adding fresh items and loans on them.
    let stop = Arc::new(AtomicBool::new(false));
    let mut writer_handles = Vec::new();
    for _ in 0..5 {
        let host = host.to_string();
        let tenant = tenant.clone();
        let stop = stop.clone();
        writer_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            while !stop.load(Ordering::Relaxed) {
                let eid = add_item(&client).await;
                let _ = borrow(&client, eid, uid, today(), today() + DAY).await;
            }
        }));
    }

    let n_readers = 10;
    let reads_per_reader = 300;
    let mut reader_handles = Vec::new();
    for r in 0..n_readers {
        let host = host.to_string();
        let tenant = tenant.clone();
        let eid = eids[r % eids.len()];
        reader_handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &tenant).await;
            let mut latencies = Vec::with_capacity(reads_per_reader);
            for i in 0..reads_per_reader {
                let sql = if i % 2 == 0 {
                    "SELECT * FROM equipment WHERE status = 'available'".to_string()
                } else {
                    format!("SELECT * FROM loans WHERE equipment_id = '{eid}'")
                };
                let t = Instant::now();
                client.simple_query(&sql).await.unwrap();
                latencies.push(t.elapsed());
            }
            latencies
        }));
    }

    let mut all_latencies = Vec::new();
    for h in reader_handles {
        all_latencies.extend(h.await.unwrap());
    }
    stop.store(true, Ordering::Relaxed);
    for h in writer_handles {
        let _ = h.await;
    }

    print_latency("catalog and loan reads", &mut all_latencies);
}

async fn phase4_connection_storm(host: &str, port: u16) {
    let n_conns = 50;
    let ops_per_conn = 10;

    let start = Instant::now();
    let success = Arc::new(AtomicUsize::new(0));
    let mut handles = Vec::new();
    for _ in 0..n_conns {
        let host = host.to_string();
        let success = success.clone();
        handles.push(tokio::spawn(async move {
            let client = connect(&host, port, &fresh_tenant()).await;
            let uid = add_member(&client, 0).await;
            let eid = add_item(&client).await;
            for i in 0..ops_per_conn {
                let s = today() + i * DAY;
                borrow(&client, eid, uid, s, s).await.unwrap();
            }
            success.fetch_add(1, Ordering::Relaxed);
        }));
    }
    for h in handles {
        let _ = h.await;
    }

    let elapsed = start.elapsed();
    let ok = success.load(Ordering::Relaxed);
    println!(
        "  {n_conns} connections, {ops_per_conn} loans each: {ok}/{n_conns} succeeded in {:.2}s",
        elapsed.as_secs_f64()
    );
}

#[tokio::main]
async fn main() {
    let host = std::env::var("EQUIPLOAN_HOST").unwrap_or_else(|_| "127.0.0.1".into());
    let port: u16 = std::env::var("EQUIPLOAN_PORT")
        .unwrap_or_else(|_| "5433".into())
        .parse()
        .expect("invalid EQUIPLOAN_PORT");

    println!("=== equiploan stress benchmark ===");
    println!("target: {host}:{port}\n");

    println!("[phase 1] sequential loan throughput");
    phase1_sequential(&host, port).await;

    println!("\n[phase 2] contended borrowing");
    phase2_contention(&host, port).await;

    println!("\n[phase 3] read latency under write load");
    phase3_read_under_load(&host, port).await;

    println!("\n[phase 4] connection storm");
    phase4_connection_storm(&host, port).await;

    println!("\n=== benchmark complete ===");
}
