use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_postgres::{Client, Config, NoTls, SimpleQueryMessage, SimpleQueryRow};
use ulid::Ulid;

use innkeep::auth::Credentials;
use innkeep::engine::Engine;
use innkeep::sync::{FeedError, FeedFetcher, Synchronizer};
use innkeep::wire::{self, ServerState};

// ── Test infrastructure ──────────────────────────────────────

/// Serves the same calendar for every feed URL.
struct StaticFeed(String);

#[async_trait]
impl FeedFetcher for StaticFeed {
    async fn fetch(&self, _url: &str) -> Result<String, FeedError> {
        Ok(self.0.clone())
    }
}

const AIRBNB_FEED: &str = "BEGIN:VCALENDAR\r\n\
VERSION:2.0\r\n\
PRODID:-//Airbnb Inc//Hosting Calendar//EN\r\n\
BEGIN:VEVENT\r\n\
UID:hold-1@airbnb.com\r\n\
DTSTART;VALUE=DATE:20300710\r\n\
DTEND;VALUE=DATE:20300713\r\n\
SUMMARY:Reserved\r\n\
END:VEVENT\r\n\
END:VCALENDAR\r\n";

async fn start_test_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let sync = Synchronizer::new(
        Arc::new(StaticFeed(AIRBNB_FEED.to_string())),
        2,
        Duration::from_secs(5),
    );
    let state = Arc::new(ServerState {
        engine: Arc::new(Engine::in_memory()),
        sync: Arc::new(sync),
        credentials: Credentials::new("admin-pw", "app-pw"),
    });

    tokio::spawn(async move {
        loop {
            let (socket, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(_) => break,
            };
            let state = state.clone();
            tokio::spawn(async move {
                let _ = wire::process_connection(socket, state, None).await;
            });
        }
    });

    addr
}

async fn connect(addr: SocketAddr, user: &str, password: &str) -> Result<Client, tokio_postgres::Error> {
    let mut config = Config::new();
    config
        .host(addr.ip().to_string())
        .port(addr.port())
        .dbname("innkeep")
        .user(user)
        .password(password);

    let (client, connection) = config.connect(NoTls).await?;
    tokio::spawn(async move {
        let _ = connection.await;
    });
    Ok(client)
}

async fn admin(addr: SocketAddr) -> Client {
    connect(addr, "admin", "admin-pw").await.unwrap()
}

async fn app(addr: SocketAddr) -> Client {
    connect(addr, "app", "app-pw").await.unwrap()
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

fn sqlstate(err: &tokio_postgres::Error) -> Option<&str> {
    err.code().map(|c| c.code())
}

struct Fixture {
    property: Ulid,
    lion: Ulid,
    bear: Ulid,
    breakfast: Ulid,
}

/// One property with two rooms and an add-on.
async fn seed(client: &Client) -> Fixture {
    let f = Fixture {
        property: Ulid::new(),
        lion: Ulid::new(),
        bear: Ulid::new(),
        breakfast: Ulid::new(),
    };
    client
        .batch_execute(&format!(
            "INSERT INTO properties (id, name, whole_property_rate, check_in_time, check_out_time) \
             VALUES ('{}', 'Orchard Barn', 400, '15:00', '10:00');\
             INSERT INTO rooms (id, property_id, name, base_price, capacity, bathroom, features) \
             VALUES ('{}', '{}', 'Lion', 120, 2, 'ensuite', ARRAY['sea view', 'desk']);\
             INSERT INTO rooms (id, property_id, name, base_price, capacity, bathroom) \
             VALUES ('{}', '{}', 'Bear', 90, 2, 'shared');\
             INSERT INTO add_ons (id, property_id, name, price) VALUES ('{}', '{}', 'Breakfast', 15)",
            f.property, f.lion, f.property, f.bear, f.property, f.breakfast, f.property
        ))
        .await
        .unwrap();
    f
}

fn booking_insert(f: &Fixture, rooms: &str, check_in: &str, check_out: &str) -> String {
    format!(
        "INSERT INTO bookings (property_id, room_ids, check_in, check_out, guests, first_name, last_name, email) \
         VALUES ('{}', '{rooms}', '{check_in}', '{check_out}', 2, 'Ada', 'Lovelace', 'ada@example.com')",
        f.property
    )
}

// ── Tests ────────────────────────────────────────────────────

#[tokio::test]
async fn catalogue_round_trip() {
    let addr = start_test_server().await;
    let client = admin(addr).await;
    let f = seed(&client).await;

    let rooms = rows(
        &client,
        &format!("SELECT * FROM rooms WHERE property_id = '{}'", f.property),
    )
    .await;
    assert_eq!(rooms.len(), 2);
    let lion = rooms
        .iter()
        .find(|r| r.get("name") == Some("Lion"))
        .unwrap();
    assert_eq!(lion.get("base_price"), Some("120.00"));
    assert_eq!(lion.get("features"), Some("{sea view,desk}"));

    client
        .batch_execute(&format!("UPDATE rooms SET base_price = 130 WHERE id = '{}'", f.lion))
        .await
        .unwrap();
    let lion = rows(&client, &format!("SELECT * FROM rooms WHERE property_id = '{}'", f.property))
        .await
        .into_iter()
        .find(|r| r.get("name") == Some("Lion"))
        .unwrap();
    assert_eq!(lion.get("base_price"), Some("130.00"));
    // untouched columns keep their values
    assert_eq!(lion.get("bathroom"), Some("ensuite"));
}

#[tokio::test]
async fn quote_applies_rules_and_add_ons() {
    let addr = start_test_server().await;
    let client = admin(addr).await;
    let f = seed(&client).await;

    client
        .batch_execute(&format!(
            "INSERT INTO pricing_rules (id, property_id, type, start_date, end_date, price_modifier, modifier_type) \
             VALUES ('{}', '{}', 'seasonal', '2030-06-01', '2030-08-31', 25, 'percentage')",
            Ulid::new(),
            f.property
        ))
        .await
        .unwrap();

    let quote = rows(
        &client,
        &format!(
            "SELECT * FROM quote WHERE property_id = '{}' AND room_ids = '{{{}}}' \
             AND check_in = '2030-06-10' AND check_out = '2030-06-12' AND add_ons = '{{{}}}'",
            f.property, f.lion, f.breakfast
        ),
    )
    .await;
    assert_eq!(quote.len(), 1);
    let q = &quote[0];
    assert_eq!(q.get("nights"), Some("2"));
    assert_eq!(q.get("base_price"), Some("240.00"));
    assert_eq!(q.get("adjustments"), Some("60.00"));
    assert_eq!(q.get("accommodation_price"), Some("300.00"));
    assert_eq!(q.get("add_ons_price"), Some("15.00"));
    assert_eq!(q.get("total_price"), Some("315.00"));
}

#[tokio::test]
async fn overlapping_booking_is_refused() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let f = seed(&admin).await;
    let guest = app(addr).await;

    guest
        .batch_execute(&booking_insert(&f, &format!("{{{}}}", f.lion), "2030-05-01", "2030-05-04"))
        .await
        .unwrap();

    let err = guest
        .batch_execute(&booking_insert(&f, &format!("{{{}}}", f.lion), "2030-05-03", "2030-05-05"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    // back-to-back stays share the changeover day
    guest
        .batch_execute(&booking_insert(&f, &format!("{{{}}}", f.lion), "2030-05-04", "2030-05-06"))
        .await
        .unwrap();

    let availability = rows(
        &guest,
        &format!(
            "SELECT * FROM availability WHERE property_id = '{}' AND is_whole_property = true \
             AND check_in = '2030-05-02' AND check_out = '2030-05-03'",
            f.property
        ),
    )
    .await;
    assert_eq!(availability[0].get("available"), Some("false"));
    assert!(availability[0].get("conflict_booking_id").is_some());

    let bear_free = rows(
        &guest,
        &format!(
            "SELECT * FROM availability WHERE property_id = '{}' AND room_ids = '{{{}}}' \
             AND check_in = '2030-05-02' AND check_out = '2030-05-03'",
            f.property, f.bear
        ),
    )
    .await;
    assert_eq!(bear_free[0].get("available"), Some("true"));
}

#[tokio::test]
async fn payment_callback_is_idempotent() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let f = seed(&admin).await;
    let webhook = app(addr).await;

    let metadata = format!(
        r#"{{"property_id":"{}","check_in":"2030-09-01","check_out":"2030-09-03","selected_rooms":"[\"{}\"]","guests":"2","guest_first_name":"Grace","guest_last_name":"Hopper","guest_email":"grace@example.com"}}"#,
        f.property, f.bear
    );
    let insert = format!(
        "INSERT INTO payment_events (session_id, paid, metadata) VALUES ('cs_test_1', true, '{metadata}')"
    );

    for _ in 0..3 {
        webhook.batch_execute(&insert).await.unwrap();
    }

    let bookings = rows(
        &admin,
        "SELECT * FROM bookings WHERE stripe_session_id = 'cs_test_1'",
    )
    .await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].get("status"), Some("confirmed"));
    assert_eq!(bookings[0].get("payment_status"), Some("paid"));
    assert_eq!(bookings[0].get("total_price"), Some("180.00"));

    let all = rows(
        &admin,
        &format!("SELECT * FROM bookings WHERE property_id = '{}'", f.property),
    )
    .await;
    assert_eq!(all.len(), 1);
}

#[tokio::test]
async fn unpaid_session_writes_nothing() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let f = seed(&admin).await;

    admin
        .batch_execute(&format!(
            r#"INSERT INTO payment_events (session_id, paid, metadata) VALUES ('cs_unpaid', false, '{{"property_id":"{}"}}')"#,
            f.property
        ))
        .await
        .unwrap();
    let bookings = rows(&admin, "SELECT * FROM bookings WHERE stripe_session_id = 'cs_unpaid'").await;
    assert!(bookings.is_empty());
}

#[tokio::test]
async fn app_role_cannot_touch_catalogue() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let f = seed(&admin).await;
    let guest = app(addr).await;

    let err = guest
        .batch_execute(&format!("UPDATE rooms SET base_price = 1 WHERE id = '{}'", f.lion))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    let err = guest
        .simple_query(&format!("SELECT * FROM bookings WHERE property_id = '{}'", f.property))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("42501"));

    // browsing the catalogue is fine
    let rooms = rows(&guest, &format!("SELECT * FROM rooms WHERE property_id = '{}'", f.property)).await;
    assert_eq!(rooms.len(), 2);
}

#[tokio::test]
async fn unknown_user_and_wrong_password_are_refused() {
    let addr = start_test_server().await;
    assert!(connect(addr, "postgres", "admin-pw").await.is_err());
    assert!(connect(addr, "admin", "app-pw").await.is_err());
}

#[tokio::test]
async fn status_transitions_over_the_wire() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let f = seed(&admin).await;

    let id = Ulid::new();
    admin
        .batch_execute(&format!(
            "INSERT INTO bookings (id, property_id, room_ids, check_in, check_out, first_name, last_name, email, source) \
             VALUES ('{id}', '{}', '{{{}}}', '2030-04-01', '2030-04-03', 'Ada', 'Lovelace', 'ada@example.com', 'airbnb')",
            f.property, f.lion
        ))
        .await
        .unwrap();

    admin
        .batch_execute(&format!("UPDATE bookings SET status = 'cancelled' WHERE id = '{id}'"))
        .await
        .unwrap();
    let err = admin
        .batch_execute(&format!("UPDATE bookings SET status = 'confirmed' WHERE id = '{id}'"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("55000"));

    let booking = rows(&admin, &format!("SELECT * FROM bookings WHERE id = '{id}'")).await;
    assert_eq!(booking[0].get("status"), Some("cancelled"));
    assert_eq!(booking[0].get("source"), Some("airbnb"));

    // a cancelled booking frees its dates
    admin
        .batch_execute(&booking_insert(&f, &format!("{{{}}}", f.lion), "2030-04-01", "2030-04-03"))
        .await
        .unwrap();
}

#[tokio::test]
async fn calendar_sync_blocks_rooms_and_exports() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let f = seed(&admin).await;

    admin
        .batch_execute(&format!(
            "INSERT INTO room_feeds (id, room_id, url) VALUES ('{}', '{}', 'https://www.airbnb.com/calendar/ical/1.ics')",
            Ulid::new(),
            f.lion
        ))
        .await
        .unwrap();

    let report = rows(&admin, "SELECT * FROM calendar_sync").await;
    assert_eq!(report[0].get("feeds"), Some("1"));
    assert_eq!(report[0].get("blocks_inserted"), Some("1"));

    // a second run recognises the hold it already made
    let again = rows(&admin, "SELECT * FROM calendar_sync").await;
    assert_eq!(again[0].get("blocks_inserted"), Some("0"));
    assert_eq!(again[0].get("already_blocked"), Some("1"));

    let guest = app(addr).await;
    let err = guest
        .batch_execute(&booking_insert(&f, &format!("{{{}}}", f.lion), "2030-07-11", "2030-07-12"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));

    let calendar = rows(
        &guest,
        &format!("SELECT * FROM room_calendar WHERE room_id = '{}'", f.lion),
    )
    .await;
    let ical = calendar[0].get("ical").unwrap();
    assert!(ical.contains("BEGIN:VCALENDAR"));
    assert!(ical.contains("20300710"));
}

#[tokio::test]
async fn bad_statements_get_useful_codes() {
    let addr = start_test_server().await;
    let client = admin(addr).await;

    let err = client.simple_query("SELEKT 1").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42601"));

    let err = client.simple_query("SELECT * FROM guests").await.unwrap_err();
    assert_eq!(sqlstate(&err), Some("42P01"));

    let err = client
        .simple_query(&format!("SELECT * FROM quote WHERE property_id = '{}'", Ulid::new()))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("22023"));
}

#[tokio::test]
async fn whole_property_booking_ignores_room_ids() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let f = seed(&admin).await;
    let guest = app(addr).await;

    guest
        .batch_execute(&format!(
            "INSERT INTO bookings (property_id, room_ids, is_whole_property, check_in, check_out, guests, first_name, last_name, email) \
             VALUES ('{}', '{{{}}}', true, '2030-03-01', '2030-03-03', 4, 'Ada', 'Lovelace', 'ada@example.com')",
            f.property, f.lion
        ))
        .await
        .unwrap();

    let bookings = rows(&admin, &format!("SELECT * FROM bookings WHERE property_id = '{}'", f.property)).await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].get("is_whole_property"), Some("true"));
    assert_eq!(bookings[0].get("room_ids"), Some("{}"));
    // two nights at the flat whole-property rate
    assert_eq!(bookings[0].get("total_price"), Some("800.00"));

    // the whole house is taken, so the room not named in room_ids is too
    let err = guest
        .batch_execute(&booking_insert(&f, &format!("{{{}}}", f.bear), "2030-03-02", "2030-03-04"))
        .await
        .unwrap_err();
    assert_eq!(sqlstate(&err), Some("23P01"));
}

#[tokio::test]
async fn bound_parameters_stay_inside_their_literal() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let f = seed(&admin).await;
    let guest = app(addr).await;

    let property = f.property.to_string();
    let rooms = format!("{{{}}}", f.lion);
    let inserted = guest
        .execute(
            "INSERT INTO bookings (property_id, room_ids, check_in, check_out, guests, first_name, last_name, email, special_requests) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            &[
                &property,
                &rooms,
                &"2030-02-01",
                &"2030-02-03",
                &"2",
                &"Miles",
                &"O'Brien",
                &"miles@example.com",
                &"Please leave $1 for the cleaner",
            ],
        )
        .await
        .unwrap();
    assert_eq!(inserted, 1);

    let bookings = rows(&admin, &format!("SELECT * FROM bookings WHERE property_id = '{}'", f.property)).await;
    assert_eq!(bookings.len(), 1);
    assert_eq!(bookings[0].get("last_name"), Some("O'Brien"));
    assert_eq!(bookings[0].get("special_requests"), Some("Please leave $1 for the cleaner"));
}

#[tokio::test]
async fn parameterised_quote_select() {
    let addr = start_test_server().await;
    let admin = admin(addr).await;
    let f = seed(&admin).await;
    let guest = app(addr).await;

    let statement = guest
        .prepare(
            "SELECT * FROM quote WHERE property_id = $1 AND room_ids = $2 AND check_in = $3 AND check_out = $4",
        )
        .await
        .unwrap();
    let columns: Vec<&str> = statement.columns().iter().map(|c| c.name()).collect();
    assert!(columns.contains(&"total_price"), "{columns:?}");
    assert_eq!(statement.params().len(), 4);

    let property = f.property.to_string();
    let rooms = format!("{{{}}}", f.bear);
    let quoted = guest
        .query(&statement, &[&property, &rooms, &"2030-01-10", &"2030-01-12"])
        .await
        .unwrap();
    assert_eq!(quoted.len(), 1);
    assert_eq!(quoted[0].get::<_, &str>("property_id"), property);
}
