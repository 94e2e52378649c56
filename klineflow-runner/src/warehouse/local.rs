//! Local Parquet-backed warehouse.
//!
//! Layout under `{root}/{project}/{dataset}/`:
//! - `{table}.parquet`: all rows of the table
//! - `{table}.schema.json`: the table's [`TableSpec`]; its presence is what
//!   makes the table exist
//!
//! Every mutation is read-modify-write of the table file under a per-table
//! lock, committed by writing a temporary sibling and renaming it over the
//! original. Readers see the old table or the new one, never a mix.

use super::{
    ColumnSpec, ColumnType, Literal, Statement, TableSpec, Warehouse, WarehouseError, WriteMode,
};
use klineflow_core::columnar::read_dataframe;
use klineflow_core::{ObjectStore, ObjectUri};
use parking_lot::Mutex;
use polars::prelude::*;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const DATA_SUFFIX: &str = ".parquet";
const SCHEMA_SUFFIX: &str = ".schema.json";
const TMP_SUFFIX: &str = ".tmp";

/// Warehouse dataset stored as Parquet files in a local directory.
pub struct LocalWarehouse {
    dir: PathBuf,
    project: String,
    dataset: String,
    /// Buckets load jobs may read from.
    stores: HashMap<String, Arc<dyn ObjectStore>>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalWarehouse {
    pub fn new(root: impl Into<PathBuf>, project: &str, dataset: &str) -> Self {
        let dir = root.into().join(project).join(dataset);
        Self {
            dir,
            project: project.to_string(),
            dataset: dataset.to_string(),
            stores: HashMap::new(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Allow load jobs to read objects from `store`'s bucket.
    pub fn attach_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.stores.insert(store.bucket().to_string(), store);
        self
    }

    pub fn dataset_dir(&self) -> &Path {
        &self.dir
    }

    /// Names of existing tables, sorted.
    pub fn tables(&self) -> Result<Vec<String>, WarehouseError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(WarehouseError::Io {
                    path: self.dir.clone(),
                    source,
                })
            }
        };

        let mut tables: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_suffix(SCHEMA_SUFFIX))
                    .map(str::to_string)
            })
            .collect();
        tables.sort();
        Ok(tables)
    }

    pub fn table_spec(&self, table: &str) -> Result<TableSpec, WarehouseError> {
        check_table_name(table)?;
        let path = self.schema_path(table);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(WarehouseError::TableNotFound {
                    table: table.to_string(),
                })
            }
            Err(source) => return Err(WarehouseError::Io { path, source }),
        };
        serde_json::from_str(&content)
            .map_err(|e| WarehouseError::Columnar(format!("schema of {table}: {e}")))
    }

    /// All rows of `table`, conformed to its spec.
    pub fn read_table(&self, table: &str) -> Result<DataFrame, WarehouseError> {
        let lock = self.lock_for(table);
        let _guard = lock.lock();
        let spec = self.table_spec(table)?;
        self.read_rows(table, &spec)
    }

    fn data_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}{DATA_SUFFIX}"))
    }

    fn schema_path(&self, table: &str) -> PathBuf {
        self.dir.join(format!("{table}{SCHEMA_SUFFIX}"))
    }

    fn lock_for(&self, table: &str) -> Arc<Mutex<()>> {
        self.locks.lock().entry(table.to_string()).or_default().clone()
    }

    fn read_rows(&self, table: &str, spec: &TableSpec) -> Result<DataFrame, WarehouseError> {
        let path = self.data_path(table);
        let file = fs::File::open(&path).map_err(|source| WarehouseError::Io {
            path: path.clone(),
            source,
        })?;
        let df = ParquetReader::new(file)
            .finish()
            .map_err(|e| WarehouseError::Columnar(format!("read {table}: {e}")))?;
        conform(table, spec, &df)
    }

    fn write_rows(&self, table: &str, mut df: DataFrame) -> Result<(), WarehouseError> {
        let path = self.data_path(table);
        write_atomic(&path, |file| {
            ParquetWriter::new(file)
                .finish(&mut df)
                .map(|_| ())
                .map_err(|e| WarehouseError::Columnar(format!("write {table}: {e}")))
        })
    }

    fn insert_row(
        &self,
        table: &str,
        values: &[(String, Literal)],
    ) -> Result<usize, WarehouseError> {
        let spec = self.table_spec(table)?;
        if let Some((name, _)) = values.iter().find(|(name, _)| spec.column(name).is_none()) {
            return Err(WarehouseError::mismatch(table, format!("unknown column '{name}'")));
        }

        let columns = spec
            .columns
            .iter()
            .map(|col| {
                let value = values
                    .iter()
                    .find(|(name, _)| *name == col.name)
                    .map(|(_, v)| v)
                    .unwrap_or(&Literal::Null);
                literal_column(table, col, value)
            })
            .collect::<Result<Vec<_>, _>>()?;
        let row = DataFrame::new(columns).map_err(columnar)?;

        let existing = self.read_rows(table, &spec)?;
        let combined = existing.vstack(&row).map_err(columnar)?;
        self.write_rows(table, combined)?;
        Ok(1)
    }

    fn delete_where_eq(
        &self,
        table: &str,
        column: &str,
        value: &str,
    ) -> Result<usize, WarehouseError> {
        let spec = self.table_spec(table)?;
        let df = self.read_rows(table, &spec)?;

        let keep: BooleanChunked = {
            let values = df
                .column(column)
                .map_err(|_| {
                    WarehouseError::mismatch(table, format!("unknown column '{column}'"))
                })?
                .str()
                .map_err(|e| WarehouseError::mismatch(table, format!("'{column}': {e}")))?;
            values.into_iter().map(|v| v != Some(value)).collect()
        };

        let kept = df.filter(&keep).map_err(columnar)?;
        let removed = df.height() - kept.height();
        if removed > 0 {
            self.write_rows(table, kept)?;
        }
        Ok(removed)
    }

    fn derive_timestamps(
        &self,
        table: &str,
        pairs: &[(String, String)],
    ) -> Result<usize, WarehouseError> {
        let spec = self.table_spec(table)?;
        let mut df = self.read_rows(table, &spec)?;
        let mut touched = vec![false; df.height()];

        for (source, target) in pairs {
            match spec.column(target) {
                Some(col) if col.ty == ColumnType::Timestamp => {}
                _ => {
                    return Err(WarehouseError::mismatch(
                        table,
                        format!("'{target}' is not a timestamp column"),
                    ))
                }
            }

            let as_millis = |name: &str| -> Result<Vec<Option<i64>>, WarehouseError> {
                let col = df
                    .column(name)
                    .map_err(|_| {
                        WarehouseError::mismatch(table, format!("unknown column '{name}'"))
                    })?
                    .cast(&DataType::Int64)
                    .map_err(columnar)?;
                Ok(col.i64().map_err(columnar)?.into_iter().collect())
            };
            let source_ms = as_millis(source)?;
            let mut target_ms = as_millis(target)?;

            let mut changed = false;
            for (row, (dst, src)) in target_ms.iter_mut().zip(&source_ms).enumerate() {
                if dst.is_none() && src.is_some() {
                    *dst = *src;
                    touched[row] = true;
                    changed = true;
                }
            }
            if !changed {
                continue;
            }

            let filled = Series::new(target.as_str().into(), target_ms)
                .cast(&ColumnType::Timestamp.dtype())
                .map_err(columnar)?;
            df.with_column(Column::from(filled)).map_err(columnar)?;
        }

        let affected = touched.iter().filter(|&&t| t).count();
        if affected > 0 {
            self.write_rows(table, df)?;
        }
        Ok(affected)
    }
}

impl Warehouse for LocalWarehouse {
    fn dataset_id(&self) -> String {
        format!("{}.{}", self.project, self.dataset)
    }

    fn ensure_dataset(&self) -> Result<(), WarehouseError> {
        fs::create_dir_all(&self.dir).map_err(|source| WarehouseError::Io {
            path: self.dir.clone(),
            source,
        })
    }

    fn ensure_table(&self, table: &str, spec: &TableSpec) -> Result<bool, WarehouseError> {
        check_table_name(table)?;
        self.ensure_dataset()?;

        let lock = self.lock_for(table);
        let _guard = lock.lock();
        if self.schema_path(table).exists() {
            return Ok(false);
        }

        let columns = spec
            .columns
            .iter()
            .map(|col| {
                Column::from(Series::new_empty(col.name.as_str().into(), &col.ty.dtype()))
            })
            .collect();
        let empty = DataFrame::new(columns).map_err(columnar)?;
        self.write_rows(table, empty)?;

        let schema = serde_json::to_vec_pretty(spec)
            .map_err(|e| WarehouseError::Columnar(format!("schema of {table}: {e}")))?;
        write_atomic(&self.schema_path(table), |file| {
            use std::io::Write;
            let path = self.schema_path(table);
            file.write_all(&schema)
                .map_err(|source| WarehouseError::Io { path, source })
        })?;

        info!(dataset = %self.dataset_id(), table, "table created");
        Ok(true)
    }

    fn load_parquet(
        &self,
        table: &str,
        uri: &ObjectUri,
        mode: WriteMode,
    ) -> Result<usize, WarehouseError> {
        let store = self
            .stores
            .get(&uri.bucket)
            .ok_or_else(|| WarehouseError::UnknownBucket {
                bucket: uri.bucket.clone(),
            })?;
        let job_err = |detail: String| WarehouseError::LoadJob {
            uri: uri.to_string(),
            detail,
        };

        let bytes = store.get_object(&uri.path).map_err(|e| job_err(e.to_string()))?;
        let incoming = read_dataframe(bytes).map_err(|e| job_err(e.to_string()))?;

        let lock = self.lock_for(table);
        let _guard = lock.lock();
        let spec = self.table_spec(table)?;
        let incoming = conform(table, &spec, &incoming)?;
        let rows = incoming.height();

        let combined = match mode {
            WriteMode::Append => self
                .read_rows(table, &spec)?
                .vstack(&incoming)
                .map_err(columnar)?,
        };
        self.write_rows(table, combined)?;

        debug!(table, %uri, rows, "load job complete");
        Ok(rows)
    }

    fn execute(&self, statement: &Statement) -> Result<usize, WarehouseError> {
        let table = statement.table();
        let lock = self.lock_for(table);
        let _guard = lock.lock();

        match statement {
            Statement::Insert { values, .. } => self.insert_row(table, values),
            Statement::DeleteWhereEq { column, value, .. } => {
                self.delete_where_eq(table, column, value)
            }
            Statement::DeriveTimestamps { pairs, .. } => self.derive_timestamps(table, pairs),
        }
    }

    fn scan_strings(&self, table: &str, column: &str) -> Result<Vec<String>, WarehouseError> {
        let df = self.read_table(table)?;
        let values = df
            .column(column)
            .map_err(|_| WarehouseError::mismatch(table, format!("unknown column '{column}'")))?
            .str()
            .map_err(|e| WarehouseError::mismatch(table, format!("'{column}': {e}")))?;
        Ok(values.into_iter().flatten().map(str::to_string).collect())
    }
}

/// Reshape `df` to `spec`: columns in spec order, cast to the spec types.
///
/// Missing nullable columns become nulls and extra columns are dropped.
/// A missing required column, a null in a required column, or a value that
/// does not cast is a schema mismatch.
fn conform(table: &str, spec: &TableSpec, df: &DataFrame) -> Result<DataFrame, WarehouseError> {
    let height = df.height();
    let mut columns = Vec::with_capacity(spec.columns.len());

    for col in &spec.columns {
        let dtype = col.ty.dtype();
        let column = match df.column(&col.name) {
            Ok(existing) => {
                let cast = existing.cast(&dtype).map_err(|e| {
                    WarehouseError::mismatch(table, format!("'{}' as {dtype}: {e}", col.name))
                })?;
                if cast.null_count() > existing.null_count() {
                    return Err(WarehouseError::mismatch(
                        table,
                        format!("'{}' has values that are not {dtype}", col.name),
                    ));
                }
                cast
            }
            Err(_) if col.nullable => {
                Column::from(Series::full_null(col.name.as_str().into(), height, &dtype))
            }
            Err(_) => {
                return Err(WarehouseError::mismatch(
                    table,
                    format!("missing required column '{}'", col.name),
                ))
            }
        };

        if !col.nullable && column.null_count() > 0 {
            return Err(WarehouseError::mismatch(
                table,
                format!("null in required column '{}'", col.name),
            ));
        }
        columns.push(column);
    }

    DataFrame::new(columns).map_err(columnar)
}

fn literal_column(
    table: &str,
    col: &ColumnSpec,
    value: &Literal,
) -> Result<Column, WarehouseError> {
    let name: PlSmallStr = col.name.as_str().into();
    let series = match (value, col.ty) {
        (Literal::Null, ty) if col.nullable => Series::full_null(name, 1, &ty.dtype()),
        (Literal::String(s), ColumnType::String) => Series::new(name, &[s.as_str()]),
        (Literal::Int64(v), ColumnType::Int64) => Series::new(name, &[*v]),
        (Literal::Int64(v), ColumnType::Float64) => Series::new(name, &[*v as f64]),
        (Literal::TimestampMs(ms), ColumnType::Timestamp) => Series::new(name, &[*ms])
            .cast(&col.ty.dtype())
            .map_err(columnar)?,
        (other, ty) => {
            return Err(WarehouseError::mismatch(
                table,
                format!("{other:?} does not fit column '{}' ({ty:?})", col.name),
            ))
        }
    };
    Ok(Column::from(series))
}

/// Write through `write` into a temporary sibling of `path`, then rename.
fn write_atomic<F>(path: &Path, write: F) -> Result<(), WarehouseError>
where
    F: FnOnce(&mut fs::File) -> Result<(), WarehouseError>,
{
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(TMP_SUFFIX);
    let tmp = PathBuf::from(tmp_name);

    let result = fs::File::create(&tmp)
        .map_err(|source| WarehouseError::Io {
            path: tmp.clone(),
            source,
        })
        .and_then(|mut file| {
            write(&mut file)?;
            file.sync_all().map_err(|source| WarehouseError::Io {
                path: tmp.clone(),
                source,
            })
        })
        .and_then(|()| {
            fs::rename(&tmp, path).map_err(|source| WarehouseError::Io {
                path: path.to_path_buf(),
                source,
            })
        });

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn check_table_name(table: &str) -> Result<(), WarehouseError> {
    let ok = !table.is_empty()
        && table
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if ok {
        Ok(())
    } else {
        Err(WarehouseError::TableNotFound {
            table: table.to_string(),
        })
    }
}

fn columnar(e: PolarsError) -> WarehouseError {
    WarehouseError::Columnar(e.to_string())
}
