use anyhow::{Context, Result};
use log::debug;
use itertools::Itertools;
use sqlx::postgres::{PgArguments, PgPoolOptions, PgRow};
use sqlx::query::Query;
use sqlx::{PgPool, Postgres, Row as _, Transaction};
use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{
    EntityKind, FieldType, Hierarchy, Id, Key, KeyPart, KeySpec, Row, Scalar, EQUIVALENCE_TABLE,
};
use crate::store::traits::{
    EntityStore, EntityTx, EquivalenceStore, HierarchyStore, StoreResult,
};

type PgQuery<'q> = Query<'q, Postgres, PgArguments>;

#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("Failed to run database migrations")?;
        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn quote(ident: &str) -> String {
    format!("\"{}\"", ident)
}

/// Parameter cast matching the column type in the migrations.
fn cast(ty: FieldType) -> &'static str {
    match ty {
        FieldType::Int => "int8",
        FieldType::Number => "numeric",
        FieldType::Text | FieldType::Enum(_) => "text",
        FieldType::Uuid => "uuid",
        FieldType::Json => "jsonb",
    }
}

fn column_type(kind: EntityKind, column: &str) -> FieldType {
    kind.spec().key_type(column)
}

/// Text form of a measurement for a `::numeric` parameter. `Display` is the
/// shortest string that parses back to the same `f64`, so no digits are lost
/// the way a float8 to numeric cast drops everything past 15 of them.
fn numeric_text(n: f64) -> String {
    n.to_string()
}

fn bind_scalar<'q>(query: PgQuery<'q>, value: &Scalar) -> PgQuery<'q> {
    match value {
        Scalar::Int(i) => query.bind(*i),
        Scalar::Number(n) => query.bind(numeric_text(*n)),
        Scalar::Text(s) => query.bind(s.clone()),
        Scalar::Uuid(u) => query.bind(*u),
        Scalar::Json(j) => query.bind(j.clone()),
    }
}

fn bind_all<'q>(mut query: PgQuery<'q>, values: &[Scalar]) -> PgQuery<'q> {
    for value in values {
        query = bind_scalar(query, value);
    }
    query
}

/// `SELECT` list returning the primary key columns with stable types.
fn key_select(kind: EntityKind) -> String {
    kind.spec()
        .key_columns()
        .iter()
        .map(|c| format!("{}::{}", quote(c), cast(column_type(kind, c))))
        .join(", ")
}

/// `WHERE` clause comparing `columns` to `row`; missing values match NULL.
fn where_clause(
    kind: EntityKind,
    columns: &[&str],
    row: &Row,
    binds: &mut Vec<Scalar>,
) -> String {
    let conditions: Vec<String> = columns
        .iter()
        .map(|c| match row.get(*c) {
            Some(value) => {
                binds.push(value.clone());
                format!("{} = ${}::{}", quote(c), binds.len(), cast(column_type(kind, c)))
            }
            None => format!("{} IS NULL", quote(c)),
        })
        .collect();
    if conditions.is_empty() {
        "TRUE".to_string()
    } else {
        conditions.join(" AND ")
    }
}

fn key_row(kind: EntityKind, key: &Key) -> Row {
    kind.spec()
        .key_columns()
        .iter()
        .zip(key.parts())
        .map(|(c, part)| (c.to_string(), part.to_scalar()))
        .collect()
}

fn decode_key(kind: EntityKind, row: &PgRow) -> StoreResult<Key> {
    let spec = kind.spec();
    let mut parts = Vec::with_capacity(spec.key_columns().len());
    for (i, column) in spec.key_columns().iter().enumerate() {
        let part = match column_type(kind, column) {
            FieldType::Uuid => KeyPart::Uuid(row.try_get::<Uuid, _>(i)?),
            _ => KeyPart::Int(row.try_get::<i64, _>(i)?),
        };
        parts.push(part);
    }
    Ok(Key::from_parts(parts))
}

/// Rebuild a catalog row from `to_jsonb(t)`.
fn decode_row(kind: EntityKind, json: serde_json::Value) -> StoreResult<Row> {
    let spec = kind.spec();
    let mut row = Row::new();
    let serde_json::Value::Object(map) = json else {
        return Err(StoreError::Backend(format!("{} row is not an object", spec.table)));
    };
    let serial = matches!(spec.key, KeySpec::Serial).then_some(("id", FieldType::Int));
    let columns = spec.fields.iter().map(|f| (f.name, f.ty)).chain(serial);
    for (name, ty) in columns {
        let Some(value) = map.get(name).filter(|v| !v.is_null()) else {
            continue;
        };
        let scalar = match ty {
            FieldType::Int => value.as_i64().map(Scalar::Int),
            FieldType::Number => value.as_f64().map(Scalar::Number),
            FieldType::Text | FieldType::Enum(_) => value.as_str().map(Scalar::from),
            FieldType::Uuid => value
                .as_str()
                .and_then(|s| Uuid::parse_str(s).ok())
                .map(Scalar::Uuid),
            FieldType::Json => Some(Scalar::Json(value.clone())),
        };
        let scalar = scalar.ok_or_else(|| {
            StoreError::Backend(format!(
                "{}.{} holds an unexpected value {}",
                spec.table, name, value
            ))
        })?;
        row.insert(name.to_string(), scalar);
    }
    Ok(row)
}

fn classify(table: &'static str, err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(db) = &err {
        match db.code().as_deref() {
            Some("23505") => return StoreError::UniqueViolation { table },
            Some("23503") => {
                return StoreError::ForeignKeyViolation {
                    table,
                    detail: db.message().to_string(),
                }
            }
            _ => {}
        }
    }
    StoreError::Database(err)
}

#[async_trait::async_trait]
impl EntityStore for PostgresStore {
    async fn begin(&self) -> StoreResult<Box<dyn EntityTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresTx { tx }))
    }

    async fn count(&self, kind: EntityKind) -> StoreResult<u64> {
        let sql = format!("SELECT count(*) FROM {}", quote(kind.table()));
        let count: i64 = sqlx::query_scalar(&sql).fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn exists(&self, kind: EntityKind, key: &Key) -> StoreResult<bool> {
        let mut binds = Vec::new();
        let lookup = key_row(kind, key);
        let condition = where_clause(kind, kind.spec().key_columns(), &lookup, &mut binds);
        let sql = format!("SELECT 1 FROM {} WHERE {} LIMIT 1", quote(kind.table()), condition);
        let row = bind_all(sqlx::query(&sql), &binds).fetch_optional(&self.pool).await?;
        Ok(row.is_some())
    }

    async fn get(&self, kind: EntityKind, key: &Key) -> StoreResult<Option<Row>> {
        let mut binds = Vec::new();
        let lookup = key_row(kind, key);
        let condition = where_clause(kind, kind.spec().key_columns(), &lookup, &mut binds);
        let sql = format!(
            "SELECT to_jsonb(t) FROM {} t WHERE {}",
            quote(kind.table()),
            condition
        );
        let row = bind_all(sqlx::query(&sql), &binds).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(decode_row(kind, row.try_get(0)?)?)),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl HierarchyStore for PostgresStore {
    async fn parents(&self, hierarchy: Hierarchy, id: Id) -> StoreResult<Vec<Id>> {
        let sql = format!(
            "SELECT parent::int8 FROM {} WHERE id = $1 ORDER BY parent",
            quote(hierarchy.table())
        );
        Ok(sqlx::query_scalar::<_, Id>(&sql).bind(id).fetch_all(&self.pool).await?)
    }

    async fn children(&self, hierarchy: Hierarchy, id: Id) -> StoreResult<Vec<Id>> {
        let sql = format!(
            "SELECT id::int8 FROM {} WHERE parent = $1 ORDER BY id",
            quote(hierarchy.table())
        );
        Ok(sqlx::query_scalar::<_, Id>(&sql).bind(id).fetch_all(&self.pool).await?)
    }

    async fn edges(&self, hierarchy: Hierarchy) -> StoreResult<Vec<(Id, Id)>> {
        let sql = format!(
            "SELECT id::int8, parent::int8 FROM {} ORDER BY id, parent",
            quote(hierarchy.table())
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> StoreResult<(Id, Id)> { Ok((row.try_get(0)?, row.try_get(1)?)) })
            .collect()
    }
}

#[async_trait::async_trait]
impl EquivalenceStore for PostgresStore {
    async fn pairs(&self) -> StoreResult<Vec<(Id, Id)>> {
        let sql = format!(
            "SELECT left_thing::int8, right_thing::int8 FROM {} ORDER BY left_thing, right_thing",
            EQUIVALENCE_TABLE
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|row| -> StoreResult<(Id, Id)> { Ok((row.try_get(0)?, row.try_get(1)?)) })
            .collect()
    }
}

pub struct PostgresTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait::async_trait]
impl EntityTx for PostgresTx {
    async fn find(
        &mut self,
        kind: EntityKind,
        columns: &[&'static str],
        row: &Row,
    ) -> StoreResult<Option<Key>> {
        let mut binds = Vec::new();
        let condition = where_clause(kind, columns, row, &mut binds);
        let sql = format!(
            "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT 1",
            key_select(kind),
            quote(kind.table()),
            condition,
            kind.spec().key_columns().iter().map(|c| quote(c)).join(", ")
        );
        let found = bind_all(sqlx::query(&sql), &binds)
            .fetch_optional(&mut *self.tx)
            .await?;
        found.map(|row| decode_key(kind, &row)).transpose()
    }

    async fn exists(&mut self, kind: EntityKind, key: &Key) -> StoreResult<bool> {
        let mut binds = Vec::new();
        let lookup = key_row(kind, key);
        let condition = where_clause(kind, kind.spec().key_columns(), &lookup, &mut binds);
        let sql = format!("SELECT 1 FROM {} WHERE {} LIMIT 1", quote(kind.table()), condition);
        let row = bind_all(sqlx::query(&sql), &binds)
            .fetch_optional(&mut *self.tx)
            .await?;
        Ok(row.is_some())
    }

    async fn insert(&mut self, kind: EntityKind, row: &Row) -> StoreResult<Key> {
        let table = kind.table();
        let mut columns = Vec::with_capacity(row.len());
        let mut params = Vec::with_capacity(row.len());
        let mut binds = Vec::with_capacity(row.len());
        for (column, value) in row {
            binds.push(value.clone());
            columns.push(quote(column));
            params.push(format!("${}::{}", binds.len(), cast(column_type(kind, column))));
        }
        // ON CONFLICT keeps the transaction usable after a lost race
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT DO NOTHING RETURNING {}",
            quote(table),
            columns.join(", "),
            params.join(", "),
            key_select(kind)
        );
        debug!("{}", sql);
        let inserted = bind_all(sqlx::query(&sql), &binds)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| classify(table, e))?;
        match inserted {
            Some(row) => decode_key(kind, &row),
            None => Err(StoreError::UniqueViolation { table }),
        }
    }

    async fn insert_edge(
        &mut self,
        hierarchy: Hierarchy,
        child: Id,
        parent: Id,
    ) -> StoreResult<bool> {
        let table = hierarchy.table();
        let sql = format!(
            "INSERT INTO {} (id, parent) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            quote(table)
        );
        let result = sqlx::query(&sql)
            .bind(child)
            .bind(parent)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| classify(table, e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_equivalence(&mut self, left: Id, right: Id) -> StoreResult<bool> {
        let sql = format!(
            "INSERT INTO {} (left_thing, right_thing) VALUES ($1, $2) ON CONFLICT DO NOTHING",
            EQUIVALENCE_TABLE
        );
        let result = sqlx::query(&sql)
            .bind(left)
            .bind(right)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| classify(EQUIVALENCE_TABLE, e))?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> StoreResult<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
