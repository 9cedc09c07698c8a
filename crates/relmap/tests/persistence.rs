mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use common::{AUTHOR_INSERT_WIDTH, Author, Recorder, row, run, unwrap_err, unwrap_outcome};
use relmap::prelude::*;
use relmap::{ConstraintError, ConstraintKind, Dialect};

/// Answer `INSERT ... RETURNING "id"` with one fresh id per inserted row.
fn returning_ids(conn: &Recorder) -> Arc<AtomicI64> {
    let next = Arc::new(AtomicI64::new(0));
    let counter = Arc::clone(&next);
    conn.on_query(move |sql, params| {
        if !sql.starts_with("INSERT INTO \"authors\"") {
            return Ok(Vec::new());
        }
        Ok((0..params.len() / AUTHOR_INSERT_WIDTH)
            .map(|_| row(&[("id", Value::BigInt(counter.fetch_add(1, Ordering::SeqCst) + 1))]))
            .collect())
    });
    next
}

#[test]
fn batch_insert_reports_every_row() {
    let conn = Recorder::new(Dialect::Postgres);
    returning_ids(&conn);
    let mut session = Session::new(conn.clone());
    let mut authors: Vec<Author> = ["a", "b", "c", "d", "e"].into_iter().map(Author::named).collect();

    run(|cx| async move {
        let inserted = unwrap_outcome(session.create_in_batches(&cx, &mut authors, 2).await);
        assert_eq!(inserted, 5);
        let ids: Vec<i64> = authors.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert!(authors.iter().all(|a| a.created_at > 0 && a.updated_at > 0));
    });

    let sql = conn.sql();
    assert_eq!(sql.first().map(String::as_str), Some("BEGIN"));
    assert_eq!(sql.last().map(String::as_str), Some("COMMIT"));
    assert_eq!(sql.iter().filter(|s| s.starts_with("INSERT")).count(), 3);
}

#[test]
fn batch_insert_without_returning_counts_rows() {
    let conn = Recorder::new(Dialect::Mysql);
    let mut session = Session::new(conn.clone());
    let mut authors: Vec<Author> = ["x", "y", "z"].into_iter().map(Author::named).collect();

    run(|cx| async move {
        let inserted = unwrap_outcome(session.create_many(&cx, &mut authors).await);
        assert_eq!(inserted, 3);
        let ids: Vec<i64> = authors.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![1, 2, 3]);
    });
}

#[test]
fn save_inserts_once_then_updates() {
    let conn = Recorder::new(Dialect::Postgres);
    returning_ids(&conn);
    let mut session = Session::with_config(
        conn.clone(),
        SessionConfig::new().skip_default_transaction(true),
    );
    let mut author = Author::named("jinzhu");

    run(|cx| async move {
        unwrap_outcome(session.save(&cx, &mut author).await);
        assert_eq!(author.id, 1);
        author.name = "jinzhu 2".to_string();
        unwrap_outcome(session.save(&cx, &mut author).await);
    });

    let statements = conn.statements();
    assert_eq!(statements.len(), 2);
    assert!(statements[0].0.starts_with("INSERT INTO \"authors\""));
    assert!(statements[1].0.starts_with("UPDATE \"authors\" SET"));
    assert!(!statements[1].0.contains("\"created_at\""));
    assert!(statements[1].1.contains(&Value::from("jinzhu 2")));
}

/// A tiny `authors` table that understands soft and hard deletes.
fn soft_delete_store(conn: &Recorder) -> Arc<Mutex<Vec<(i64, Option<i64>)>>> {
    let table = Arc::new(Mutex::new(vec![(1, None), (2, None)]));

    let reads = Arc::clone(&table);
    conn.on_query(move |sql, _| {
        let scoped = sql.contains("\"authors\".\"deleted_at\" IS NULL");
        let mut rows: Vec<Row> = reads
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, deleted)| !scoped || deleted.is_none())
            .map(|(id, deleted)| {
                row(&[
                    ("id", Value::BigInt(*id)),
                    ("name", Value::from(format!("author {id}"))),
                    ("deleted_at", Value::from(*deleted)),
                ])
            })
            .collect();
        if sql.contains("LIMIT 1") {
            rows.truncate(1);
        }
        Ok(rows)
    });

    let writes = Arc::clone(&table);
    conn.on_execute(move |sql, params| {
        let id = params.last().and_then(Value::as_i64);
        let mut table = writes.lock().unwrap();
        if sql.starts_with("UPDATE \"authors\" SET \"deleted_at\"") {
            let at = params.first().and_then(Value::as_i64);
            for entry in table.iter_mut().filter(|(i, _)| Some(*i) == id) {
                entry.1 = at;
            }
        } else if sql.starts_with("DELETE FROM \"authors\"") {
            table.retain(|(i, _)| Some(*i) != id);
        }
        Ok(1)
    });
    table
}

#[test]
fn soft_deleted_records_are_hidden_until_unscoped() {
    let conn = Recorder::new(Dialect::Postgres);
    let table = soft_delete_store(&conn);
    let mut session = Session::with_config(
        conn.clone(),
        SessionConfig::new().skip_default_transaction(true),
    );

    run(|cx| async move {
        let mut first = unwrap_outcome(session.first(&cx, Query::<Author>::new()).await);
        assert_eq!(first.id, 1);

        unwrap_outcome(session.delete(&cx, &mut first).await);
        assert!(first.deleted_at.is_some());

        let visible = unwrap_outcome(session.find(&cx, Query::<Author>::new()).await);
        assert_eq!(visible.iter().map(|a| a.id).collect::<Vec<_>>(), vec![2]);
        let next = unwrap_outcome(session.first(&cx, Query::<Author>::new()).await);
        assert_eq!(next.id, 2);

        let everything = unwrap_outcome(session.find(&cx, Query::<Author>::new().unscoped()).await);
        assert_eq!(everything.len(), 2);

        let removed = unwrap_outcome(
            session
                .delete_where(&cx, Query::<Author>::new().unscoped().filter("id = ?", vec![Value::BigInt(1)]))
                .await,
        );
        assert_eq!(removed, 1);
    });

    assert_eq!(*table.lock().unwrap(), vec![(2, None)]);
    assert!(conn.sql().contains(&"DELETE FROM \"authors\" WHERE id = $1".to_string()));
}

#[test]
fn failed_insert_rolls_back_the_transaction() {
    let conn = Recorder::new(Dialect::Postgres);
    let names = Arc::new(Mutex::new(HashSet::from(["11".to_string()])));
    let next_id = AtomicI64::new(100);
    conn.on_query(move |sql, params| {
        if !sql.starts_with("INSERT INTO \"authors\"") {
            return Ok(Vec::new());
        }
        let name = params.first().and_then(Value::as_str).unwrap_or_default().to_string();
        if !names.lock().unwrap().insert(name.clone()) {
            return Err(Error::Constraint(ConstraintError {
                kind: ConstraintKind::Unique,
                constraint: Some("authors_name_key".to_string()),
                sqlstate: Some("23505".to_string()),
                message: format!("duplicate name {name}"),
            }));
        }
        Ok(vec![row(&[("id", Value::BigInt(next_id.fetch_add(1, Ordering::SeqCst)))])])
    });

    let connect = conn.clone();
    let db = Db::new(Pool::new(PoolConfig::new(1)).unwrap(), move || {
        let conn = connect.clone();
        async move { Outcome::Ok(conn) }
    });
    let mut thirteen = Author::named("13");
    let mut eleven = Author::named("11");

    run(|cx| async move {
        let mut session = unwrap_outcome(db.session(&cx).await);
        let err = unwrap_err(
            session
                .transaction(&cx, async |tx| {
                    try_outcome!(tx.create(&cx, &mut thirteen).await);
                    tx.create(&cx, &mut eleven).await
                })
                .await,
        );
        assert!(err.is_unique_violation());
        assert_eq!(session.state(), relmap::TxState::RolledBack);
    });

    let sql = conn.sql();
    assert_eq!(sql.first().map(String::as_str), Some("BEGIN"));
    assert_eq!(sql.last().map(String::as_str), Some("ROLLBACK"));
    assert_eq!(sql.iter().filter(|s| s.starts_with("INSERT")).count(), 2);
    assert!(!sql.iter().any(|s| s == "COMMIT"));
}
