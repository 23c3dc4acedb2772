use criterion::{Criterion, black_box, criterion_group, criterion_main};
use migro::db::{self, Selection};
use rusqlite::Connection;

fn bench_db_operations(c: &mut Criterion) {
    // Setup in-memory DB
    let conn = Connection::open_in_memory().unwrap();
    db::create_schema(&conn).unwrap();

    for i in 0..10_000 {
        db::enroll_file(&conn, "s3", &format!("bucket/key_{}.jpg", i), Some(1024)).unwrap();
    }

    let mut next = 0u64;
    c.bench_function("db_enroll_file", |b| {
        b.iter(|| {
            next += 1;
            db::enroll_file(&conn, "urls", &format!("https://bench/{}", next), None).unwrap()
        })
    });

    c.bench_function("db_enroll_existing_file", |b| {
        b.iter(|| db::enroll_file(&conn, "s3", black_box("bucket/key_42.jpg"), Some(1024)).unwrap())
    });

    c.bench_function("db_list_pending_files", |b| {
        b.iter(|| db::list_pending_files(&conn, "s3", true).unwrap())
    });

    let attempt_id = db::start_attempt(&conn, "s3", 10_000).unwrap();
    db::mark_files_for_attempt(&conn, attempt_id, Selection::PendingAndError).unwrap();

    let mut i = 0;
    c.bench_function("db_record_success", |b| {
        b.iter(|| {
            i = (i + 1) % 10_000;
            let path = format!("bucket/key_{}.jpg", i);
            db::record_success(&conn, "s3", &path, attempt_id, "uuid").unwrap()
        })
    });

    c.bench_function("db_not_uploaded_summary", |b| {
        b.iter(|| db::not_uploaded_summary(&conn).unwrap())
    });
}

criterion_group!(benches, bench_db_operations);
criterion_main!(benches);
