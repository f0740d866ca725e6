//! The spatial database the phases read from and write to.
//!
//! Every table follows the `<schema>.nbm2_<geography>_<vintage>` naming
//! contract. Identifiers are always escaped and values always bound as
//! parameters; nothing user-controlled is spliced into SQL text unescaped.

use std::{fmt, path::Path};

use bytes::BytesMut;
use futures::{pin_mut, SinkExt, StreamExt, TryStreamExt};
use postgres_protocol::escape::escape_identifier;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};
use tokio_postgres::{types::ToSql, NoTls, Row};
use tracing::{debug, debug_span, warn, Instrument};

use crate::{
    config::DbConfig,
    error::{Error, Result},
};

const COPY_CHUNK: usize = 1 << 20;

/// A schema-qualified table name. Displays as two escaped identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableName {
    pub schema: String,
    pub name: String,
}

impl TableName {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}",
            escape_identifier(&self.schema),
            escape_identifier(&self.name)
        )
    }
}

/// `nbm2_<geography>_<vintage>`
pub fn table_name(geography: &str, vintage: &str) -> String {
    format!("nbm2_{geography}_{vintage}")
}

/// Escapes a column name for use in SQL text.
pub fn column(name: &str) -> String {
    escape_identifier(name)
}

pub struct Database {
    client: tokio_postgres::Client,
    schema: String,
}

impl Database {
    pub async fn connect(config: &DbConfig) -> Result<Self> {
        let span = debug_span!("db_connect", host = %config.host, database = %config.database);
        async move {
            let mut pg = tokio_postgres::Config::new();
            pg.host(&config.host)
                .port(config.port)
                .user(&config.user)
                .dbname(&config.database)
                .application_name("nbm");
            if !config.password.is_empty() {
                pg.password(&config.password);
            }
            let (client, connection) = pg.connect(NoTls).await?;
            // the connection object performs the actual communication
            tokio::spawn(async move {
                if let Err(e) = connection.await {
                    warn!(error = %e, "database connection closed with an error");
                }
            });
            debug!("connected");
            Ok(Self {
                client,
                schema: config.schema.clone(),
            })
        }
        .instrument(span)
        .await
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// `<schema>.nbm2_<geography>_<vintage>`
    pub fn table(&self, geography: &str, vintage: &str) -> TableName {
        TableName::new(&self.schema, table_name(geography, vintage))
    }

    pub async fn batch_execute(&self, sql: &str) -> Result<()> {
        Ok(self.client.batch_execute(sql).await?)
    }

    pub async fn execute(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<u64> {
        Ok(self.client.execute(sql, params).await?)
    }

    pub async fn query(&self, sql: &str, params: &[&(dyn ToSql + Sync)]) -> Result<Vec<Row>> {
        Ok(self.client.query(sql, params).await?)
    }

    /// Streams the rows of a query to `each` without buffering the result
    /// set.
    pub async fn for_each_row(
        &self,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
        mut each: impl FnMut(Row) -> Result<()>,
    ) -> Result<u64> {
        let rows = self
            .client
            .query_raw(sql, params.iter().map(|p| *p as &dyn ToSql))
            .await?;
        pin_mut!(rows);
        let mut seen = 0;
        while let Some(row) = rows.try_next().await? {
            each(row)?;
            seen += 1;
        }
        Ok(seen)
    }

    pub async fn table_exists(&self, table: &TableName) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "SELECT EXISTS (SELECT 1 FROM information_schema.tables \
                 WHERE table_schema = $1 AND table_name = $2)",
                &[&table.schema, &table.name],
            )
            .await?;
        Ok(row.get(0))
    }

    pub async fn drop_table(&self, table: &TableName) -> Result<()> {
        self.batch_execute(&format!("DROP TABLE IF EXISTS {table} CASCADE"))
            .await
    }

    /// A b-tree index on one column, named after the table and column.
    pub async fn create_index(&self, table: &TableName, on: &str) -> Result<()> {
        let index = escape_identifier(&format!("{}_{}_btree", table.name, on.to_lowercase()));
        self.batch_execute(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} ({})",
            column(on)
        ))
        .await
    }

    /// A GiST index on a geometry column.
    pub async fn create_gist_index(&self, table: &TableName, on: &str) -> Result<()> {
        let index = escape_identifier(&format!("{}_{}_gist", table.name, on.to_lowercase()));
        self.batch_execute(&format!(
            "CREATE INDEX IF NOT EXISTS {index} ON {table} USING GIST ({})",
            column(on)
        ))
        .await
    }

    /// Replaces `table` with the contents of a headed CSV file. Every column
    /// is created as `text`.
    pub async fn copy_in_csv(&self, table: &TableName, path: &Path) -> Result<u64> {
        let headers = csv_headers(path)?;
        let columns = headers
            .iter()
            .map(|h| format!("{} text", column(h)))
            .collect::<Vec<_>>()
            .join(", ");
        self.drop_table(table).await?;
        self.batch_execute(&format!("CREATE TABLE {table} ({columns})"))
            .await?;

        let sink = self
            .client
            .copy_in(&format!(
                "COPY {table} FROM STDIN WITH (FORMAT csv, HEADER true)"
            ))
            .await?;
        pin_mut!(sink);
        let mut file = File::open(path).await?;
        let mut sent = 0u64;
        loop {
            let mut chunk = BytesMut::with_capacity(COPY_CHUNK);
            if file.read_buf(&mut chunk).await? == 0 {
                break;
            }
            sent += chunk.len() as u64;
            sink.send(chunk.freeze()).await?;
        }
        let rows = sink.finish().await?;
        debug!(%table, rows, bytes = sent, "copied csv into table");
        Ok(rows)
    }

    /// Writes the result of `select` to a headed CSV file.
    pub async fn copy_out_csv(&self, select: &str, path: &Path) -> Result<u64> {
        let stream = self
            .client
            .copy_out(&format!(
                "COPY ({select}) TO STDOUT WITH (FORMAT csv, HEADER true)"
            ))
            .await?;
        pin_mut!(stream);
        let mut file = File::create(path).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            written += chunk.len() as u64;
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        debug!(path = %path.display(), bytes = written, "copied query out to csv");
        Ok(written)
    }

    /// Distinct county codes of the block table, sorted.
    pub async fn counties(&self, block_table: &TableName) -> Result<Vec<String>> {
        let rows = self
            .query(
                &format!(
                    "SELECT DISTINCT {county} FROM {block_table} ORDER BY 1",
                    county = column("COUNTY_FIPS")
                ),
                &[],
            )
            .await?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }
}

fn csv_headers(path: &Path) -> Result<Vec<String>> {
    if !path.exists() {
        Err(Error::MissingInput(path.to_path_buf()))?
    }
    let mut reader = csv::Reader::from_path(path)?;
    let headers: Vec<String> = reader.headers()?.iter().map(String::from).collect();
    if headers.is_empty() || headers.iter().any(|h| h.is_empty()) {
        Err(Error::UnexpectedColumns(path.to_path_buf()))?
    }
    Ok(headers)
}
