//! SQL text building for the applier and copier: identifier quoting and
//! per-change DML statements with text-format parameters.

use bytes::BytesMut;
use postgres_types::{to_sql_checked, Format, IsNull, ToSql, Type};

use crate::messages::{Cell, RelationDesc};

/// Double-quote an identifier, doubling any embedded quotes.
pub fn quote_ident(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 2);
    out.push('"');
    for c in name.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Qualified, quoted table name. The public schema is elided if and only if
/// the namespace is literally `public` or empty.
pub fn qualified_name(namespace: &str, name: &str) -> String {
    if namespace.is_empty() || namespace == "public" {
        quote_ident(name)
    } else {
        format!("{}.{}", quote_ident(namespace), quote_ident(name))
    }
}

/// A parameter bound in text format with an unspecified type, so the
/// destination's input functions perform the coercion from text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextParam(pub Option<String>);

impl ToSql for TextParam {
    fn to_sql(
        &self,
        _ty: &Type,
        out: &mut BytesMut,
    ) -> Result<IsNull, Box<dyn std::error::Error + Sync + Send>> {
        match &self.0 {
            None => Ok(IsNull::Yes),
            Some(v) => {
                out.extend_from_slice(v.as_bytes());
                Ok(IsNull::No)
            }
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    fn encode_format(&self, _ty: &Type) -> Format {
        Format::Text
    }

    to_sql_checked!();
}

#[derive(Debug, PartialEq, Eq)]
pub struct DmlStatement {
    pub sql: String,
    pub params: Vec<TextParam>,
}

fn cell_param(cell: &Cell) -> TextParam {
    match cell {
        Cell::Null => TextParam(None),
        Cell::Value(v) => TextParam(Some(v.clone())),
        // Builders skip toast cells before binding.
        Cell::UnchangedToast => TextParam(None),
    }
}

pub fn build_insert(rel: &RelationDesc, new_tuple: &[Cell]) -> DmlStatement {
    let mut columns = Vec::new();
    let mut params = Vec::new();
    for (column, cell) in rel.columns.iter().zip(new_tuple) {
        if matches!(cell, Cell::UnchangedToast) {
            continue;
        }
        columns.push(quote_ident(&column.name));
        params.push(cell_param(cell));
    }
    let placeholders: Vec<String> = (1..=params.len()).map(|i| format!("${i}")).collect();
    DmlStatement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            qualified_name(&rel.namespace, &rel.name),
            columns.join(", "),
            placeholders.join(", "),
        ),
        params,
    }
}

/// SET from the new tuple (toast cells omitted: the value was not shipped
/// and the existing one must be preserved), WHERE from the identity tuple.
/// Placeholder numbering continues from SET through WHERE.
pub fn build_update(
    rel: &RelationDesc,
    old_tuple: Option<&[Cell]>,
    new_tuple: &[Cell],
) -> DmlStatement {
    let mut assignments = Vec::new();
    let mut params = Vec::new();
    let mut placeholder = 0usize;
    for (column, cell) in rel.columns.iter().zip(new_tuple) {
        if matches!(cell, Cell::UnchangedToast) {
            continue;
        }
        placeholder += 1;
        assignments.push(format!("{} = ${placeholder}", quote_ident(&column.name)));
        params.push(cell_param(cell));
    }
    // Replica identity carries the identity columns in the old tuple; without
    // one, the new tuple has to identify the row.
    let identity = old_tuple.unwrap_or(new_tuple);
    let (predicates, mut where_params) = identity_predicates(rel, identity, placeholder);
    params.append(&mut where_params);
    DmlStatement {
        sql: format!(
            "UPDATE {} SET {} WHERE {}",
            qualified_name(&rel.namespace, &rel.name),
            assignments.join(", "),
            predicates.join(" AND "),
        ),
        params,
    }
}

pub fn build_delete(rel: &RelationDesc, old_tuple: &[Cell]) -> DmlStatement {
    let (predicates, params) = identity_predicates(rel, old_tuple, 0);
    DmlStatement {
        sql: format!(
            "DELETE FROM {} WHERE {}",
            qualified_name(&rel.namespace, &rel.name),
            predicates.join(" AND "),
        ),
        params,
    }
}

pub fn build_truncate(
    relations: &[&RelationDesc],
    cascade: bool,
    restart_identity: bool,
) -> String {
    let targets: Vec<String> = relations
        .iter()
        .map(|rel| qualified_name(&rel.namespace, &rel.name))
        .collect();
    let mut sql = format!("TRUNCATE TABLE {}", targets.join(", "));
    if restart_identity {
        sql.push_str(" RESTART IDENTITY");
    }
    if cascade {
        sql.push_str(" CASCADE");
    }
    sql
}

/// Equality predicates over the cells of the identity tuple that carry a
/// value. Key-form tuples pad non-key columns with nulls, and `col = NULL`
/// can never match, so only value cells participate.
fn identity_predicates(
    rel: &RelationDesc,
    identity: &[Cell],
    first_placeholder: usize,
) -> (Vec<String>, Vec<TextParam>) {
    let mut predicates = Vec::new();
    let mut params = Vec::new();
    let mut placeholder = first_placeholder;
    for (column, cell) in rel.columns.iter().zip(identity) {
        if let Cell::Value(v) = cell {
            placeholder += 1;
            predicates.push(format!("{} = ${placeholder}", quote_ident(&column.name)));
            params.push(TextParam(Some(v.clone())));
        }
    }
    (predicates, params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::ColumnDesc;

    fn rel(namespace: &str, columns: &[(&str, bool)]) -> RelationDesc {
        RelationDesc {
            relation_id: 16384,
            namespace: namespace.to_string(),
            name: "t".to_string(),
            columns: columns
                .iter()
                .map(|(name, key)| ColumnDesc {
                    name: name.to_string(),
                    type_oid: 25,
                    part_of_key: *key,
                })
                .collect(),
        }
    }

    fn value(v: &str) -> Cell {
        Cell::Value(v.to_string())
    }

    #[test]
    fn quote_ident_simple() {
        assert_eq!(quote_ident("users"), "\"users\"");
    }

    #[test]
    fn quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn qualified_name_elides_public_and_empty() {
        assert_eq!(qualified_name("public", "t"), "\"t\"");
        assert_eq!(qualified_name("", "t"), "\"t\"");
        assert_eq!(qualified_name("app", "t"), "\"app\".\"t\"");
        // only the literal string elides, not quoted variants
        assert_eq!(qualified_name("Public", "t"), "\"Public\".\"t\"");
    }

    #[test]
    fn insert_binds_all_cells() {
        let rel = rel("public", &[("id", true), ("s", false)]);
        let stmt = build_insert(&rel, &[value("1"), Cell::Null]);
        assert_eq!(stmt.sql, "INSERT INTO \"t\" (\"id\", \"s\") VALUES ($1, $2)");
        assert_eq!(
            stmt.params,
            vec![TextParam(Some("1".to_string())), TextParam(None)]
        );
    }

    #[test]
    fn update_uses_old_tuple_identity() {
        let rel = rel("app", &[("id", true), ("s", false)]);
        let stmt = build_update(
            &rel,
            Some(&[value("1"), Cell::Null]),
            &[value("1"), value("x")],
        );
        assert_eq!(
            stmt.sql,
            "UPDATE \"app\".\"t\" SET \"id\" = $1, \"s\" = $2 WHERE \"id\" = $3"
        );
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn update_identity_falls_back_to_new_tuple() {
        let rel = rel("public", &[("id", true), ("s", false)]);
        let stmt = build_update(&rel, None, &[value("1"), value("x")]);
        assert_eq!(
            stmt.sql,
            "UPDATE \"t\" SET \"id\" = $1, \"s\" = $2 WHERE \"id\" = $3 AND \"s\" = $4"
        );
    }

    #[test]
    fn update_omits_unchanged_toast_from_set() {
        let rel = rel("public", &[("id", true), ("blob", false), ("s", false)]);
        let stmt = build_update(
            &rel,
            Some(&[value("7"), Cell::Null, Cell::Null]),
            &[value("7"), Cell::UnchangedToast, value("x")],
        );
        // numbering continues across the omitted column
        assert_eq!(
            stmt.sql,
            "UPDATE \"t\" SET \"id\" = $1, \"s\" = $2 WHERE \"id\" = $3"
        );
        assert_eq!(stmt.params.len(), 3);
    }

    #[test]
    fn truncate_combines_targets_and_options() {
        let a = rel("public", &[("id", true)]);
        let mut b = rel("app", &[("id", true)]);
        b.name = "u".to_string();
        assert_eq!(
            build_truncate(&[&a, &b], false, false),
            "TRUNCATE TABLE \"t\", \"app\".\"u\""
        );
        assert_eq!(
            build_truncate(&[&a], true, true),
            "TRUNCATE TABLE \"t\" RESTART IDENTITY CASCADE"
        );
    }

    #[test]
    fn delete_matches_value_cells_only() {
        let rel = rel("public", &[("id", true), ("s", false)]);
        let stmt = build_delete(&rel, &[value("3"), Cell::Null]);
        assert_eq!(stmt.sql, "DELETE FROM \"t\" WHERE \"id\" = $1");
        assert_eq!(stmt.params, vec![TextParam(Some("3".to_string()))]);
    }
}
