use anyhow::{bail, Result};

use crate::database::Database;
use crate::decode::Value;

pub fn execute_command(database_path: &str, command: &str) -> Result<()> {
    match command {
        ".dbinfo" => handle_dbinfo(database_path),
        ".tables" => handle_tables(database_path),
        ".schema" => handle_schema(database_path),
        cmd => {
            if let Some(table) = cmd.strip_prefix("export ") {
                handle_export(database_path, table.trim())
            } else if let Some(table) = cmd.strip_prefix("rows ") {
                handle_rows(database_path, table.trim())
            } else {
                bail!("Unsupported command: {}", cmd)
            }
        }
    }
}

fn handle_dbinfo(database_path: &str) -> Result<()> {
    let mut db = Database::open_file(database_path)?;
    let header = db.file_header().clone();

    println!("database page size: {}", header.page_size);
    println!("database page count: {}", header.page_count);
    println!("schema format: {}", header.schema_format);
    println!("text encoding: {}", header.text_encoding);
    println!("number of tables: {}", db.tables()?.len());

    Ok(())
}

fn handle_tables(database_path: &str) -> Result<()> {
    let mut db = Database::open_file(database_path)?;

    for table in db.tables()? {
        println!("{}", table.name);
    }

    Ok(())
}

fn handle_schema(database_path: &str) -> Result<()> {
    let mut db = Database::open_file(database_path)?;

    for table in db.tables()? {
        println!("{} (root page: {})", table.name, table.root_page);
        if let Some(sql) = &table.sql {
            println!("  SQL: {}", sql);
        }
    }

    Ok(())
}

/// Write the table's rows to stdout as CSV, rowid first.
fn handle_export(database_path: &str, table: &str) -> Result<()> {
    let mut db = Database::open_file(database_path)?;

    for row in db.rows(table)? {
        let mut fields = vec![row.rowid.to_string()];
        fields.extend(
            row.values
                .iter()
                .map(|v| escape_csv(&v.to_display_string())),
        );
        println!("{}", fields.join(","));
    }

    Ok(())
}

/// Display the table's rows in the pipe-separated terminal format.
fn handle_rows(database_path: &str, table: &str) -> Result<()> {
    let mut db = Database::open_file(database_path)?;

    for row in db.rows(table)? {
        let values: Vec<String> = row.values.iter().map(Value::to_display_string).collect();
        println!("{}|{}", row.rowid, values.join("|"));
    }

    Ok(())
}

fn escape_csv(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
