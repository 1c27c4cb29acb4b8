use sq_agents::arsenal::Arsenal;

/// Run the `arsenal` subcommand: probe PATH and print the tool table.
pub fn run() -> anyhow::Result<u8> {
    let arsenal = Arsenal::probe();

    println!("{:<14} {:<12} {}", "category", "preferred", "selected");
    println!("{}", "-".repeat(44));
    for status in arsenal.status_report() {
        let selected = match &status.selected {
            Some(tool) if status.is_fallback() => format!("{tool} (fallback)"),
            Some(tool) => tool.clone(),
            None => "-".to_string(),
        };
        println!(
            "{:<14} {:<12} {}",
            status.category.as_str(),
            status.preferred,
            selected
        );
    }

    let suggestions = arsenal.install_suggestions();
    if !suggestions.is_empty() {
        println!();
        println!("Suggestions:");
        for line in suggestions {
            println!("  {line}");
        }
    }
    Ok(0)
}
