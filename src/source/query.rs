//! Relational query source.
//!
//! Runs one SQL statement per fetch and maps the result set onto the
//! declared shape: `SCALAR` takes the first column of the first row,
//! `SPECTRUM` the first column across all rows, `IMAGE` the whole table.
//! Connections are opened and closed per call; there is no pooling. SQLite
//! is the in-build engine (behind the `source_db` feature); schemas naming
//! another engine surface a `FeatureNotEnabled` error at fetch time.

use super::{DataSource, FetchContext, SourceEnv};
use crate::error::{WriterError, WriterResult};
use crate::schema::element::XmlElement;
use crate::types::{DataRecord, Rank};
use async_trait::async_trait;

/// Declared result shape of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryFormat {
    Scalar,
    Spectrum,
    Image,
}

impl QueryFormat {
    fn from_schema(tag: Option<&str>) -> WriterResult<QueryFormat> {
        match tag {
            None | Some("SCALAR") => Ok(QueryFormat::Scalar),
            Some("SPECTRUM") => Ok(QueryFormat::Spectrum),
            Some("IMAGE") => Ok(QueryFormat::Image),
            Some(other) => Err(WriterError::SourceSetup(format!(
                "unknown query format '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DbEngine {
    Sqlite,
    MySql,
    Postgres,
}

impl DbEngine {
    fn from_schema(tag: Option<&str>) -> WriterResult<DbEngine> {
        match tag {
            None | Some("SQLITE3") | Some("SQLITE") => Ok(DbEngine::Sqlite),
            Some("MYSQL") => Ok(DbEngine::MySql),
            Some("PGSQL") | Some("POSTGRES") => Ok(DbEngine::Postgres),
            Some(other) => Err(WriterError::SourceSetup(format!(
                "unknown database engine '{}'",
                other
            ))),
        }
    }
}

pub struct RelationalQuerySource {
    engine: DbEngine,
    dsn: String,
    query: String,
    format: QueryFormat,
}

impl Default for RelationalQuerySource {
    fn default() -> Self {
        RelationalQuerySource {
            engine: DbEngine::Sqlite,
            dsn: String::new(),
            query: String::new(),
            format: QueryFormat::Scalar,
        }
    }
}

#[async_trait]
impl DataSource for RelationalQuerySource {
    async fn setup(&mut self, config: &XmlElement, _env: &SourceEnv) -> WriterResult<()> {
        let database = config.child("database").ok_or_else(|| {
            WriterError::SourceSetup("query source without a <database> element".to_string())
        })?;
        self.engine = DbEngine::from_schema(database.attr("dbtype"))?;
        self.dsn = match self.engine {
            DbEngine::Sqlite => {
                let file = database.attr("file").unwrap_or(":memory:");
                if file == ":memory:" {
                    "sqlite::memory:".to_string()
                } else {
                    format!("sqlite:{}", file)
                }
            }
            // Held only for the diagnostic; these engines are not compiled
            // in and fail at fetch time.
            _ => database.attr("dbname").unwrap_or_default().to_string(),
        };
        let query = config.child("query").ok_or_else(|| {
            WriterError::SourceSetup("query source without a <query> element".to_string())
        })?;
        self.format = QueryFormat::from_schema(query.attr("format"))?;
        self.query = query.text.trim().to_string();
        if self.query.is_empty() {
            return Err(WriterError::SourceSetup("empty query text".to_string()));
        }
        Ok(())
    }

    async fn get_data(&mut self, _ctx: &FetchContext) -> WriterResult<Option<DataRecord>> {
        match self.engine {
            DbEngine::Sqlite => self.run_sqlite().await,
            DbEngine::MySql => Err(WriterError::FeatureNotEnabled("source_db_mysql".to_string())),
            DbEngine::Postgres => {
                Err(WriterError::FeatureNotEnabled("source_db_pgsql".to_string()))
            }
        }
    }

    fn is_valid(&self) -> bool {
        !self.query.is_empty()
    }

    fn declared_shape(&self) -> Option<(Rank, Vec<usize>)> {
        Some(match self.format {
            QueryFormat::Scalar => (Rank::Scalar, Vec::new()),
            QueryFormat::Spectrum => (Rank::OneD, vec![0]),
            QueryFormat::Image => (Rank::TwoD, vec![0, 0]),
        })
    }
}

#[cfg(feature = "source_db")]
mod sqlite_enabled {
    use super::*;
    use crate::types::{promote, NxType, ScalarValue};
    use sqlx::sqlite::{SqliteConnection, SqliteRow};
    use sqlx::{Connection, Row};

    fn query_err(err: sqlx::Error) -> WriterError {
        WriterError::Data(format!("query failed: {}", err))
    }

    fn cell(row: &SqliteRow, index: usize) -> WriterResult<(ScalarValue, NxType)> {
        if let Ok(v) = row.try_get::<i64, _>(index) {
            return Ok((ScalarValue::Int(v), NxType::Int64));
        }
        if let Ok(v) = row.try_get::<f64, _>(index) {
            return Ok((ScalarValue::Float(v), NxType::Float64));
        }
        if let Ok(v) = row.try_get::<String, _>(index) {
            return Ok((ScalarValue::Text(v), NxType::Char));
        }
        Err(WriterError::Data(format!(
            "unsupported value in result column {}",
            index
        )))
    }

    impl RelationalQuerySource {
        pub(super) async fn run_sqlite(&self) -> WriterResult<Option<DataRecord>> {
            let mut conn = SqliteConnection::connect(&self.dsn).await.map_err(|e| {
                WriterError::SourceSetup(format!("cannot open {}: {}", self.dsn, e))
            })?;
            let rows = sqlx::query(&self.query)
                .fetch_all(&mut conn)
                .await
                .map_err(query_err)?;
            if let Err(e) = conn.close().await {
                log::debug!("closing {} failed: {}", self.dsn, e);
            }
            if rows.is_empty() {
                return Ok(None);
            }

            let record = match self.format {
                QueryFormat::Scalar => {
                    let (value, dtype) = cell(&rows[0], 0)?;
                    DataRecord::scalar(value, dtype)
                }
                QueryFormat::Spectrum => {
                    let mut dtype = NxType::Int64;
                    let mut values = Vec::with_capacity(rows.len());
                    for (i, row) in rows.iter().enumerate() {
                        let (value, d) = cell(row, 0)?;
                        dtype = if i == 0 { d } else { promote(dtype, d)? };
                        values.push(value);
                    }
                    DataRecord::list(values, dtype).cast_to(dtype)?
                }
                QueryFormat::Image => {
                    let ncols = rows[0].len();
                    let mut dtype = NxType::Int64;
                    let mut table = Vec::with_capacity(rows.len());
                    for (i, row) in rows.iter().enumerate() {
                        let mut cells = Vec::with_capacity(ncols);
                        for c in 0..ncols {
                            let (value, d) = cell(row, c)?;
                            dtype = if i == 0 && c == 0 { d } else { promote(dtype, d)? };
                            cells.push(value);
                        }
                        table.push(cells);
                    }
                    DataRecord::table(table, dtype)?.cast_to(dtype)?
                }
            };
            Ok(Some(record))
        }
    }
}

#[cfg(not(feature = "source_db"))]
impl RelationalQuerySource {
    async fn run_sqlite(&self) -> WriterResult<Option<DataRecord>> {
        Err(WriterError::FeatureNotEnabled("source_db".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fragment(body: &str) -> XmlElement {
        XmlElement::parse(body).expect("fragment")
    }

    #[test]
    fn test_setup_parses_engine_and_format() {
        let mut source = RelationalQuerySource::default();
        let config = fragment(
            r#"<datasource type="DB">
                 <database dbtype="SQLITE3" file=":memory:"/>
                 <query format="SPECTRUM">SELECT position FROM motors</query>
               </datasource>"#,
        );
        futures::executor::block_on(async {
            let env = crate::source::SourceEnv {
                clients: std::sync::Arc::new(crate::client::ClientRegistry::new()),
                decoders: std::sync::Arc::new(crate::decode::DecoderRegistry::new()),
                pool: std::sync::Arc::new(crate::source::SourcePool::new()),
                coordinator: std::sync::Arc::new(crate::source::FetchCoordinator::new()),
                retry: crate::client::RetryPolicy::new(1, 1),
                default_scheme: "sim".to_string(),
            };
            source.setup(&config, &env).await.expect("setup");
        });
        assert!(source.is_valid());
        assert_eq!(
            source.declared_shape(),
            Some((Rank::OneD, vec![0]))
        );
    }

    #[test]
    fn test_unknown_engine_rejected() {
        assert!(DbEngine::from_schema(Some("ORACLE")).is_err());
        assert!(QueryFormat::from_schema(Some("CUBE")).is_err());
    }
}
