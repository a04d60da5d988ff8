/// `kiln graph` command implementation
use anyhow::Result;

use super::Project;
use crate::cli::GraphArgs;

pub fn run(args: &GraphArgs) -> Result<()> {
    let project = Project::load(None)?;
    let graph = project.graph(&args.filter, &args.tasks, args.only)?;

    if args.dot {
        print!("{}", graph.to_dot());
        return Ok(());
    }

    for id in graph.topological_order()? {
        let Some(node) = graph.node(&id) else {
            continue;
        };

        let command = node.command.as_deref().unwrap_or("<no script>");
        println!("{}  ({})", id, command);
        for dependency in &node.dependencies {
            println!("  └─ {}", dependency);
        }
    }

    Ok(())
}
