//! PostgreSQL-specific SQL generation: `ON CONFLICT`, `RETURNING`,
//! `GROUP BY`/`ORDER BY`/`LIMIT`/`OFFSET`/`FOR`, and join-tuple source
//! syntax for `SELECT`.
//!
//! The generic column/value builder this extends is out of scope for this
//! layer (an external collaborator, per the module this belongs to); what's
//! here renders complete statements directly, binding every value
//! positionally rather than inlining it, in the style of `sqlx`'s
//! `QueryBuilder::push_bind` (see the `other_examples` pack) rather than
//! string-interpolating values into the SQL text.

use crate::config::quote_identifier;
use crate::driver::Param;
use crate::error::Error;

/// The shape of an `ON CONFLICT` clause. `None` at the call site means no
/// clause at all; this enum's variants cover everything else §4.6
/// describes, as a tagged union rather than something the builder has to
/// sniff the runtime shape of.
pub enum OnConflict {
    /// `ON CONFLICT DO NOTHING`.
    DoNothing,
    /// `ON CONFLICT (conflict...) DO UPDATE SET ...`.
    Update {
        conflict: Vec<String>,
        set: Vec<(String, Param)>,
    },
    /// Inlined verbatim, no additional binds.
    Literal(String),
    /// Inlined verbatim, with binds appended after the statement's own.
    LiteralWithBinds(String, Vec<Param>),
}

/// The shape of a `GROUP BY` clause.
pub enum GroupBy {
    Fields(Vec<String>),
    Literal(String),
}

/// The shape of a `FOR` tail clause.
pub enum ForClause {
    Update,
    Literal(String),
}

/// One entry in a `select`'s source list: a plain table, or a join tuple
/// `[name, fk, pk, type?]` rendered as ` [type] JOIN name ON (name.fk =
/// first_table.pk)`.
pub enum Source {
    Table(String),
    Join {
        name: String,
        fk: String,
        pk: String,
        join_type: Option<String>,
    },
}

impl Source {
    pub fn table(name: impl Into<String>) -> Self {
        Source::Table(name.into())
    }

    pub fn join(
        name: impl Into<String>,
        fk: impl Into<String>,
        pk: impl Into<String>,
        join_type: Option<&str>,
    ) -> Self {
        Source::Join {
            name: name.into(),
            fk: fk.into(),
            pk: pk.into(),
            join_type: join_type.map(str::to_string),
        }
    }
}

/// Renders `INSERT INTO table (...) VALUES (...)`, followed by the
/// `on_conflict` clause (if any) and then `RETURNING` (if any and only if
/// `on_conflict` isn't already suppressing it — see §4.6).
pub fn insert(
    table: &str,
    fields: &[(&str, Param)],
    on_conflict: Option<OnConflict>,
    returning: Option<&[&str]>,
) -> Result<(String, Vec<Param>), Error> {
    if fields.is_empty() {
        return Err(Error::Builder("insert requires at least one field".to_string()));
    }

    let mut binds = Vec::new();
    let mut sql = format!("INSERT INTO {} (", quote_identifier(table));
    let columns: Vec<String> = fields.iter().map(|(name, _)| quote_identifier(name)).collect();
    sql.push_str(&columns.join(", "));
    sql.push_str(") VALUES (");
    let mut placeholders = Vec::with_capacity(fields.len());
    for (_, value) in fields {
        binds.push(value.clone());
        placeholders.push(format!("${}", binds.len()));
    }
    sql.push_str(&placeholders.join(", "));
    sql.push(')');

    if let Some(clause) = on_conflict {
        render_on_conflict(&mut sql, &mut binds, clause)?;
    }

    if let Some(cols) = returning {
        if !cols.is_empty() {
            sql.push_str(" RETURNING ");
            let quoted: Vec<String> = cols.iter().map(|c| quote_identifier(c)).collect();
            sql.push_str(&quoted.join(", "));
        }
    }

    Ok((sql, binds))
}

fn render_on_conflict(sql: &mut String, binds: &mut Vec<Param>, clause: OnConflict) -> Result<(), Error> {
    match clause {
        OnConflict::DoNothing => sql.push_str(" ON CONFLICT DO NOTHING"),
        OnConflict::Update { conflict, set } => {
            if conflict.is_empty() || set.is_empty() {
                return Err(Error::Builder(
                    "on_conflict update requires both conflict targets and a set list".to_string(),
                ));
            }
            sql.push_str(" ON CONFLICT (");
            let targets: Vec<String> = conflict.iter().map(|c| quote_identifier(c)).collect();
            sql.push_str(&targets.join(", "));
            sql.push_str(") DO UPDATE SET ");
            let mut assignments = Vec::with_capacity(set.len());
            for (column, value) in set {
                binds.push(value);
                assignments.push(format!("{} = ${}", quote_identifier(&column), binds.len()));
            }
            sql.push_str(&assignments.join(", "));
        }
        OnConflict::Literal(literal) => {
            sql.push(' ');
            sql.push_str(&literal);
        }
        OnConflict::LiteralWithBinds(literal, extra) => {
            sql.push(' ');
            sql.push_str(&literal);
            binds.extend(extra);
        }
    }
    Ok(())
}

/// Renders a full `SELECT`, including join-tuple sources and the
/// `GROUP BY`/`ORDER BY`/`LIMIT`/`OFFSET`/`FOR` tail.
#[allow(clippy::too_many_arguments)]
pub fn select(
    columns: &[&str],
    sources: &[Source],
    group_by: Option<GroupBy>,
    order_by: Option<&str>,
    limit: Option<i64>,
    offset: Option<i64>,
    for_clause: Option<ForClause>,
) -> Result<(String, Vec<Param>), Error> {
    let first_table = sources
        .iter()
        .find_map(|s| match s {
            Source::Table(name) => Some(name.clone()),
            Source::Join { .. } => None,
        })
        .ok_or_else(|| Error::Builder("select requires at least one plain table source".to_string()))?;

    let mut sql = String::from("SELECT ");
    if columns.is_empty() {
        sql.push('*');
    } else {
        sql.push_str(&columns.join(", "));
    }
    sql.push_str(" FROM ");
    sql.push_str(&first_table);

    for source in sources {
        match source {
            Source::Table(name) if name == &first_table => {}
            Source::Table(name) => {
                sql.push_str(", ");
                sql.push_str(name);
            }
            Source::Join { name, fk, pk, join_type } => {
                if let Some(t) = join_type {
                    sql.push(' ');
                    sql.push_str(&t.to_uppercase());
                }
                sql.push_str(" JOIN ");
                sql.push_str(name);
                sql.push_str(&format!(" ON ({name}.{fk} = {first_table}.{pk})"));
            }
        }
    }

    let mut binds = Vec::new();

    if let Some(clause) = group_by {
        sql.push_str(" GROUP BY ");
        match clause {
            GroupBy::Fields(fields) => {
                let quoted: Vec<String> = fields.iter().map(|f| quote_identifier(f)).collect();
                sql.push_str(&quoted.join(", "));
            }
            GroupBy::Literal(literal) => sql.push_str(&literal),
        }
    }

    if let Some(order) = order_by {
        sql.push_str(" ORDER BY ");
        sql.push_str(order);
    }

    if let Some(n) = limit {
        binds.push(Param::from(n));
        sql.push_str(&format!(" LIMIT ${}", binds.len()));
    }

    if let Some(n) = offset {
        binds.push(Param::from(n));
        sql.push_str(&format!(" OFFSET ${}", binds.len()));
    }

    if let Some(clause) = for_clause {
        match clause {
            ForClause::Update => sql.push_str(" FOR UPDATE"),
            ForClause::Literal(literal) => {
                sql.push(' ');
                sql.push_str(&literal);
            }
        }
    }

    Ok((sql, binds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_without_on_conflict() {
        let (sql, binds) = insert("t", &[("a", Param::from("b"))], None, None).unwrap();
        assert_eq!(sql, r#"INSERT INTO "t" ("a") VALUES ($1)"#);
        assert_eq!(binds.len(), 1);
    }

    #[test]
    fn insert_with_do_nothing() {
        let (sql, _) = insert("t", &[("a", Param::from("b"))], Some(OnConflict::DoNothing), None).unwrap();
        assert_eq!(sql, r#"INSERT INTO "t" ("a") VALUES ($1) ON CONFLICT DO NOTHING"#);
    }

    #[test]
    fn insert_with_conflict_update() {
        let (sql, binds) = insert(
            "t",
            &[("a", Param::from("b"))],
            Some(OnConflict::Update {
                conflict: vec!["a".to_string()],
                set: vec![("a".to_string(), Param::from("c"))],
            }),
            None,
        )
        .unwrap();
        assert_eq!(
            sql,
            r#"INSERT INTO "t" ("a") VALUES ($1) ON CONFLICT ("a") DO UPDATE SET "a" = $2"#
        );
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn returning_suppressed_when_absent() {
        let (sql, _) = insert("t", &[("a", Param::from("b"))], Some(OnConflict::DoNothing), None).unwrap();
        assert!(!sql.contains("RETURNING"));
    }

    #[test]
    fn select_with_left_join() {
        let (sql, _) = select(
            &[],
            &[Source::table("foo"), Source::join("bar", "foo_id", "id", Some("left"))],
            None,
            None,
            None,
            None,
            None,
        )
        .unwrap();
        assert_eq!(sql, "SELECT * FROM foo LEFT JOIN bar ON (bar.foo_id = foo.id)");
    }

    #[test]
    fn select_limit_offset_bind_positionally() {
        let (sql, binds) = select(&[], &[Source::table("t")], None, None, Some(10), Some(20), None).unwrap();
        assert_eq!(sql, "SELECT * FROM t LIMIT $1 OFFSET $2");
        assert_eq!(binds.len(), 2);
    }

    #[test]
    fn select_for_update() {
        let (sql, _) = select(&[], &[Source::table("t")], None, None, None, None, Some(ForClause::Update)).unwrap();
        assert!(sql.ends_with("FOR UPDATE"));
    }
}
