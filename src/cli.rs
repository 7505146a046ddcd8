use clap::{Parser, Subcommand};

use crate::{
    questions::QuestionStatus,
    visibility::{ApprovalStatus, Role, Viewer},
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

/// Act as this user. Without both flags the request is anonymous.
#[derive(clap::Args, Debug, Clone)]
pub struct ViewerArgs {
    #[clap(long)]
    pub user_id: Option<u64>,

    /// student, advisor or admin
    #[clap(long)]
    pub role: Option<Role>,
}

impl ViewerArgs {
    pub fn viewer(&self) -> Viewer {
        match (self.user_id, self.role) {
            (Some(id), Some(role)) => Viewer::user(id, role),
            _ => Viewer::Anonymous,
        }
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Start the HTTP server
    Daemon {},

    /// Questions similar to an existing one
    Similar {
        id: u64,

        #[clap(short, long)]
        limit: Option<usize>,

        /// Minimum similarity, 0.0 to 1.0
        #[clap(short, long)]
        threshold: Option<f32>,

        #[command(flatten)]
        viewer: ViewerArgs,
    },

    /// Hybrid keyword and vector search
    Search {
        /// Search text. Empty lists every visible question.
        #[clap(default_value = "")]
        query: String,

        #[clap(long)]
        category_id: Option<u64>,

        #[clap(long)]
        author_id: Option<u64>,

        /// open, answered or closed
        #[clap(long)]
        status: Option<QuestionStatus>,

        /// pending, approved or rejected
        #[clap(long)]
        approval_status: Option<ApprovalStatus>,

        #[clap(short, long, default_value = "1")]
        page: usize,

        #[clap(short, long)]
        limit: Option<usize>,

        /// Keyword matching only
        #[clap(long, default_value = "false")]
        no_vector: bool,

        #[clap(long)]
        vector_weight: Option<f32>,

        #[command(flatten)]
        viewer: ViewerArgs,
    },

    /// Generate embeddings for questions that have none
    Backfill {
        /// Re-embed every question
        #[clap(short, long, default_value = "false")]
        force: bool,
    },

    /// Print the embedding for a piece of text
    Embed { text: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_search() {
        let args = Args::try_parse_from([
            "qa-search",
            "search",
            "meal plan",
            "--status",
            "open",
            "--no-vector",
            "--user-id",
            "3",
            "--role",
            "admin",
        ])
        .unwrap();

        let Command::Search {
            query,
            status,
            no_vector,
            viewer,
            page,
            ..
        } = args.command
        else {
            panic!("expected search");
        };
        assert_eq!(query, "meal plan");
        assert_eq!(status, Some(QuestionStatus::Open));
        assert!(no_vector);
        assert_eq!(page, 1);
        assert_eq!(viewer.viewer(), Viewer::user(3, Role::Admin));
    }

    #[test]
    fn test_parse_similar_anonymous() {
        let args = Args::try_parse_from(["qa-search", "similar", "12", "--limit", "3"]).unwrap();
        let Command::Similar { id, limit, viewer, .. } = args.command else {
            panic!("expected similar");
        };
        assert_eq!(id, 12);
        assert_eq!(limit, Some(3));
        assert_eq!(viewer.viewer(), Viewer::Anonymous);
    }

    #[test]
    fn test_rejects_unknown_role() {
        assert!(Args::try_parse_from(["qa-search", "similar", "1", "--role", "dean"]).is_err());
    }
}
