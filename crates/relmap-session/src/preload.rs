//! Eager loading.
//!
//! Each relationship segment costs one query, whatever the number of owners:
//! owner keys are collected, related rows fetched with `IN (...)` and grouped
//! back onto their owners. Nested paths (`"Orders.Items"`) recurse over the
//! records loaded for the previous segment.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use asupersync::{Cx, Outcome};
use relmap_core::{
    AssociationErrorKind, Connection, DynModel, Error, Model, Operation, RelationshipInfo,
    RelationshipKind, Value, key_hash, try_outcome, try_result,
};
use relmap_query::{JoinRequest, Query, SelectSpec, Target};

use crate::Session;

/// Column alias carrying the owner key on every preloaded row.
const OWNER_KEY: &str = "__owner_key";

type Owner<'o> = &'o mut (dyn DynModel + 'static);

/// One relationship to load, with the relationships to load beneath it.
#[derive(Debug, Default)]
struct PreloadNode {
    name: String,
    condition: Option<(String, Vec<Value>)>,
    children: Vec<PreloadNode>,
}

impl PreloadNode {
    fn child(&mut self, name: &str) -> &mut PreloadNode {
        let pos = match self.children.iter().position(|c| c.name == name) {
            Some(pos) => pos,
            None => {
                self.children.push(PreloadNode {
                    name: name.to_string(),
                    ..PreloadNode::default()
                });
                self.children.len() - 1
            }
        };
        &mut self.children[pos]
    }
}

/// Merge the query's preload paths into one tree; shared prefixes load once.
fn plan<M: Model>(query: &Query<M>) -> PreloadNode {
    let mut root = PreloadNode::default();
    if query.wants_all_preloads() {
        for rel in M::RELATIONSHIPS {
            root.child(rel.name);
        }
    }
    for request in query.preloads() {
        let mut node = &mut root;
        for segment in request.segments() {
            node = node.child(segment);
        }
        if request.condition.is_some() {
            node.condition.clone_from(&request.condition);
        }
    }
    root
}

/// Resolve the query's preloads onto freshly decoded records.
pub(crate) async fn preload_records<C: Connection, M: Model>(
    session: &Session<C>,
    cx: &Cx,
    records: &mut [M],
    query: &Query<M>,
) -> Outcome<(), Error> {
    let root = plan(query);
    if root.children.is_empty() || records.is_empty() {
        return Outcome::Ok(());
    }
    let mut owners: Vec<Owner<'_>> = records
        .iter_mut()
        .map(|r| r as &mut (dyn DynModel + 'static))
        .collect();
    for node in &root.children {
        try_outcome!(load_node(session, cx, &mut owners, M::RELATIONSHIPS, node).await);
    }
    Outcome::Ok(())
}

fn load_node<'a, 'o: 'a, C: Connection>(
    session: &'a Session<C>,
    cx: &'a Cx,
    owners: &'a mut [Owner<'o>],
    relationships: &'static [RelationshipInfo],
    node: &'a PreloadNode,
) -> Pin<Box<dyn Future<Output = Outcome<(), Error>> + 'a>> {
    Box::pin(async move {
        let Some(rel) = relationships.iter().find(|r| r.name == node.name) else {
            let model = owners.first().map_or("unknown", |o| o.model_name());
            return Outcome::Err(Error::association(
                AssociationErrorKind::UnknownRelationship,
                model,
                node.name.clone(),
                "no such relationship to preload",
            ));
        };

        let mut keys: Vec<Value> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for owner in owners.iter() {
            let key = owner.column_value(rel.local_key);
            if !key.is_zero() && seen.insert(key_hash(std::slice::from_ref(&key))) {
                keys.push(key);
            }
        }
        if keys.is_empty() {
            for owner in owners.iter_mut() {
                try_result!(owner.attach(rel.name, Vec::new()));
            }
            return Outcome::Ok(());
        }

        let dialect = session.connection().dialect();
        let target = Target::related(&rel.related);
        let remote = dialect.qualified(target.table, rel.remote_key);
        let owner_column = match (rel.kind, rel.link_table) {
            (RelationshipKind::ManyToMany, Some(link)) => {
                dialect.qualified(link.table_name, link.local_column)
            }
            _ => remote.clone(),
        };
        let mut spec = SelectSpec::new().select_extra(format!(
            "{owner_column} AS {}",
            dialect.quote_identifier(OWNER_KEY)
        ));
        spec = match (rel.kind, rel.link_table) {
            (RelationshipKind::ManyToMany, Some(link)) => spec
                .join(JoinRequest::Named {
                    target: format!(
                        "INNER JOIN {} ON {} = {remote}",
                        dialect.quote_identifier(link.table_name),
                        dialect.qualified(link.table_name, link.remote_column),
                    ),
                    params: Vec::new(),
                })
                .filter(format!("{owner_column} IN (?)"), vec![Value::Array(keys)]),
            _ => spec.filter(format!("{remote} IN (?)"), vec![Value::Array(keys)]),
        };
        if let Some((fragment, params)) = &node.condition {
            spec = spec.filter(fragment.clone(), params.clone());
        }

        let built = try_result!(spec.build_select(dialect, &target));
        let rows = try_outcome!(
            session
                .run_query(cx, &built.statement, Operation::Preload, target.table)
                .await
        );

        let mut related: Vec<Box<dyn DynModel>> = Vec::with_capacity(rows.len());
        let mut by_owner: HashMap<u64, Vec<usize>> = HashMap::new();
        for (i, row) in rows.iter().enumerate() {
            related.push(try_result!(rel.related.decode(row)));
            let owner_key = row.get_by_name(OWNER_KEY).cloned().unwrap_or(Value::Null);
            by_owner
                .entry(key_hash(std::slice::from_ref(&owner_key)))
                .or_default()
                .push(i);
        }
        tracing::debug!(
            relationship = rel.name,
            table = target.table,
            owners = owners.len(),
            loaded = related.len(),
            "preloaded"
        );

        if !node.children.is_empty() && !related.is_empty() {
            let mut nested: Vec<Owner<'_>> = related.iter_mut().map(|b| b.as_mut()).collect();
            for child in &node.children {
                try_outcome!(
                    load_node(session, cx, &mut nested, rel.related.relationships(), child).await
                );
            }
        }

        for owner in owners.iter_mut() {
            let key = owner.column_value(rel.local_key);
            let matched: Vec<Box<dyn DynModel>> = by_owner
                .get(&key_hash(std::slice::from_ref(&key)))
                .map(|idx| idx.iter().map(|&i| related[i].clone_boxed()).collect())
                .unwrap_or_default();
            try_result!(owner.attach(rel.name, matched));
        }
        Outcome::Ok(())
    })
}

#[cfg(test)]
mod tests {
    use crate::Session;
    use crate::testing::{MockConnection, User, block_on, expect_err, expect_ok, row};
    use relmap_core::{AssociationErrorKind, Error, Value};
    use relmap_query::Query;

    fn users(conn: &MockConnection) {
        conn.on_query(
            "FROM \"users\"",
            vec![
                row(&[("id", Value::BigInt(1)), ("name", "a".into()), ("company_id", Value::BigInt(7))]),
                row(&[("id", Value::BigInt(2)), ("name", "b".into()), ("company_id", Value::Null)]),
            ],
        );
    }

    #[test]
    fn has_many_groups_by_owner_key() {
        let conn = MockConnection::new();
        conn.on_query(
            "FROM \"pets\"",
            vec![
                row(&[("id", Value::BigInt(10)), ("user_id", Value::BigInt(2)), ("name", "rex".into()), ("__owner_key", Value::BigInt(2))]),
                row(&[("id", Value::BigInt(11)), ("user_id", Value::BigInt(1)), ("name", "tom".into()), ("__owner_key", Value::BigInt(1))]),
                row(&[("id", Value::BigInt(12)), ("user_id", Value::BigInt(2)), ("name", "kit".into()), ("__owner_key", Value::BigInt(2))]),
            ],
        );
        users(&conn);
        let session = Session::new(conn.clone());
        block_on(|cx| async move {
            let found = expect_ok(session.find(&cx, Query::<User>::new().preload("Pets")).await);
            assert_eq!(found[0].pets.len(), 1);
            assert_eq!(found[0].pets[0].name, "tom");
            let names: Vec<&str> = found[1].pets.iter().map(|p| p.name.as_str()).collect();
            assert_eq!(names, vec!["rex", "kit"]);
        });
        let statements = conn.statements();
        assert_eq!(statements.len(), 2);
        assert_eq!(
            statements[1].0,
            "SELECT \"pets\".*, \"pets\".\"user_id\" AS \"__owner_key\" FROM \"pets\" \
             WHERE \"pets\".\"user_id\" IN ($1, $2)"
        );
        assert_eq!(statements[1].1, vec![Value::BigInt(1), Value::BigInt(2)]);
    }

    #[test]
    fn belongs_to_skips_zero_keys() {
        let conn = MockConnection::new();
        conn.on_query(
            "FROM \"companies\"",
            vec![row(&[("id", Value::BigInt(7)), ("name", "acme".into()), ("__owner_key", Value::BigInt(7))])],
        );
        users(&conn);
        let session = Session::new(conn.clone());
        block_on(|cx| async move {
            let found =
                expect_ok(session.find(&cx, Query::<User>::new().preload("Company")).await);
            assert_eq!(found[0].company.as_ref().map(|c| c.name.as_str()), Some("acme"));
            assert!(found[1].company.is_none());
        });
        assert_eq!(conn.statements()[1].1, vec![Value::BigInt(7)]);
    }

    #[test]
    fn many_to_many_goes_through_link_table() {
        let conn = MockConnection::new();
        users(&conn);
        let session = Session::new(conn.clone());
        block_on(|cx| async move {
            let found = expect_ok(
                session
                    .find(&cx, Query::<User>::new().preload_with("Languages", "code <> ?", vec!["zz".into()]))
                    .await,
            );
            assert!(found.iter().all(|u| u.languages.is_empty()));
        });
        assert_eq!(
            conn.executed_sql()[1],
            "SELECT \"languages\".*, \"user_languages\".\"user_id\" AS \"__owner_key\" \
             FROM \"languages\" INNER JOIN \"user_languages\" \
             ON \"user_languages\".\"language_id\" = \"languages\".\"id\" \
             WHERE (\"user_languages\".\"user_id\" IN ($1, $2)) AND (code <> $3)"
        );
    }

    #[test]
    fn unknown_relationship_is_rejected() {
        let conn = MockConnection::new();
        users(&conn);
        let session = Session::new(conn);
        block_on(|cx| async move {
            let err = expect_err(session.find(&cx, Query::<User>::new().preload("Friends")).await);
            assert!(matches!(
                err,
                Error::Association(ref a) if a.kind == AssociationErrorKind::UnknownRelationship
            ));
        });
    }

    #[test]
    fn no_owners_means_no_query() {
        let conn = MockConnection::new();
        let session = Session::new(conn.clone());
        block_on(|cx| async move {
            expect_ok(session.find(&cx, Query::<User>::new().preload_all()).await);
        });
        assert_eq!(conn.executed_sql().len(), 1);
    }
}
