//! Interactive menus and the registered-persons table.

use crate::flows;
use crate::input::Keys;
use anyhow::Result;
use rollcall_core::{Config, PersonRecord};
use rollcall_store::FaceStore;

/// Main menu: register, recognize, view, exit.
pub fn main_menu(config: &Config, store: &mut FaceStore, keys: &Keys) -> Result<()> {
    loop {
        println!("\n=== Rollcall: face registration and recognition ===");
        println!("1. Register a new person");
        println!("2. Start face recognition");
        println!("3. View registered persons");
        println!("4. Exit");
        let Some(choice) = keys.prompt("Select an option (1-4): ") else {
            return Ok(());
        };
        match choice.trim() {
            "1" => report(flows::register(config, store, keys)),
            "2" => report(flows::recognize(config, store, keys, false, None)),
            "3" => report(print_persons(store)),
            "4" => {
                println!("Goodbye.");
                return Ok(());
            }
            other => println!("Invalid option {other:?}; enter 1-4."),
        }
    }
}

/// Registration menu: register, view, exit.
pub fn registration_menu(config: &Config, store: &mut FaceStore, keys: &Keys) -> Result<()> {
    loop {
        println!("\n=== Person registration ===");
        println!("1. Register a new person");
        println!("2. View registered persons");
        println!("3. Exit");
        let Some(choice) = keys.prompt("Select an option (1-3): ") else {
            return Ok(());
        };
        match choice.trim() {
            "1" => report(flows::register(config, store, keys)),
            "2" => report(print_persons(store)),
            "3" => return Ok(()),
            other => println!("Invalid option {other:?}; enter 1-3."),
        }
    }
}

/// Flow failures end the flow, not the session.
fn report(result: Result<()>) {
    if let Err(e) = result {
        tracing::debug!(error = ?e, "flow failed");
        println!("Error: {e:#}");
    }
}

pub fn print_persons(store: &FaceStore) -> Result<()> {
    let persons = store.persons()?;
    if persons.is_empty() {
        println!("No persons registered yet.");
    } else {
        print!("{}", format_table(&persons));
        println!("Total: {}", persons.len());
    }
    Ok(())
}

fn format_table(persons: &[PersonRecord]) -> String {
    const HEADERS: [&str; 6] = ["ID", "Name", "Class", "Roll", "Email", "Registered"];

    let rows: Vec<[String; 6]> = persons
        .iter()
        .map(|p| {
            [
                p.id.to_string(),
                p.name.clone(),
                p.class.clone(),
                p.roll_number.clone(),
                p.email.clone(),
                p.registered_at.format("%Y-%m-%d %H:%M").to_string(),
            ]
        })
        .collect();

    let mut widths = HEADERS.map(|h| h.chars().count());
    for row in &rows {
        for (w, cell) in widths.iter_mut().zip(row) {
            *w = (*w).max(cell.chars().count());
        }
    }

    let mut out = String::new();
    let mut push_row = |cells: &[&str]| {
        let line: Vec<String> = cells
            .iter()
            .zip(widths)
            .map(|(cell, w)| format!("{cell:<w$}"))
            .collect();
        out.push_str(line.join("  ").trim_end());
        out.push('\n');
    };
    push_row(&HEADERS);
    for row in &rows {
        let cells: Vec<&str> = row.iter().map(String::as_str).collect();
        push_row(&cells);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn test_table_alignment() {
        let persons = vec![PersonRecord {
            id: 12,
            name: "Alice Wong".into(),
            class: "10A".into(),
            roll_number: "5".into(),
            email: String::new(),
            phone: String::new(),
            registered_at: NaiveDate::from_ymd_opt(2024, 1, 2)
                .unwrap()
                .and_hms_opt(8, 30, 0)
                .unwrap(),
        }];
        let table = format_table(&persons);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("ID  Name        Class"));
        assert!(lines[1].starts_with("12  Alice Wong  10A"));
        assert!(lines[1].ends_with("2024-01-02 08:30"));
    }
}
