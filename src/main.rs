use clap::Parser;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use tracing_subscriber::EnvFilter;

mod app;
mod cli;
mod config;
mod errors;
mod identity;
mod questions;
mod semantic;
mod storage;
#[cfg(test)]
mod tests;
mod visibility;
mod web;

use questions::QuestionStore;
use semantic::{SearchParams, TextEmbedder};

const BACKFILL_TEMPLATE: &str = "{bar:40} Embedding questions ({pos}/{len}, {percent}%) {msg}";

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    Ok(tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?)
}

fn print_json(value: &impl serde::Serialize) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = cli::Args::parse();
    let app = app::App::load()?;

    match args.command {
        cli::Command::Daemon {} => {
            web::start_daemon(app)?;
        }

        cli::Command::Similar {
            id,
            limit,
            threshold,
            viewer,
        } => {
            let outcome = runtime()?.block_on(app.service.similar_questions(
                id,
                viewer.viewer(),
                limit,
                threshold,
            ))?;

            if let Some(message) = &outcome.message {
                log::warn!("{message}");
            }
            print_json(&outcome.similar)?;
        }

        cli::Command::Search {
            query,
            category_id,
            author_id,
            status,
            approval_status,
            page,
            limit,
            no_vector,
            vector_weight,
            viewer,
        } => {
            let params = SearchParams {
                q: Some(query),
                category_id,
                author_id,
                status,
                approval_status,
                page: Some(page),
                limit,
                use_vector: Some(!no_vector),
                vector_weight,
            };

            let page = runtime()?.block_on(app.service.search(params, viewer.viewer()))?;

            if let Some(message) = &page.message {
                log::warn!("{message}");
            }
            log::info!(
                "page {}/{} of {} results (vector search {})",
                page.pagination.page,
                page.pagination.total_pages,
                page.pagination.total,
                if page.used_vector { "on" } else { "off" }
            );
            print_json(&page.results)?;
        }

        cli::Command::Backfill { force } => {
            let total = app.service.store().all_ids()?.len();

            let pb = ProgressBar::with_draw_target(Some(total as u64), ProgressDrawTarget::stderr());
            pb.set_style(
                ProgressStyle::with_template(BACKFILL_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );

            let report = runtime()?.block_on(app.service.backfill(force, |progress| {
                pb.set_position((progress.embedded + progress.skipped + progress.failed) as u64);
                if progress.failed > 0 {
                    pb.set_message(format!("{} failed", progress.failed));
                }
            }))?;
            pb.finish_and_clear();

            print_json(&report)?;
        }

        cli::Command::Embed { text } => {
            let vector = runtime()?.block_on(app.service.embedder().embed(&text))?;
            print_json(&vector)?;
        }
    }

    Ok(())
}
