use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use promo_gate::config;
use promo_gate::countdown::CountdownTicker;
use promo_gate::model::{Tier, Trigger};
use promo_gate::notify::{PushChannel, Reconciler};
use promo_gate::popup::{select_popup, SessionSeenSet};
use promo_gate::portal::{PopupSource, PortalClient, TriggerContext};
use promo_gate::window::{evaluate, parse_bound};
use promo_gate::ViewerContext;

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TriggerArg {
    Login,
    Logout,
    PageSpecific,
    Scheduled,
}

impl From<TriggerArg> for Trigger {
    fn from(arg: TriggerArg) -> Self {
        match arg {
            TriggerArg::Login => Trigger::Login,
            TriggerArg::Logout => Trigger::Logout,
            TriggerArg::PageSpecific => Trigger::PageSpecific,
            TriggerArg::Scheduled => Trigger::Scheduled,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum TierArg {
    Free,
    Premium,
}

impl From<TierArg> for Tier {
    fn from(arg: TierArg) -> Self {
        match arg {
            TierArg::Free => Tier::Free,
            TierArg::Premium => Tier::Premium,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Evaluate the lifecycle state of a window right now
    Window {
        #[arg(long)]
        start: Option<String>,
        #[arg(long)]
        end: Option<String>,
        #[arg(long)]
        inactive: bool,
    },
    /// Print countdown ticks until the end time or the tick limit
    Countdown {
        #[arg(long)]
        end: String,
        #[arg(long, default_value = "5")]
        ticks: u32,
    },
    /// Fetch candidates and print the popup that would be shown
    Popup {
        #[arg(long, value_enum)]
        trigger: TriggerArg,
        #[arg(long)]
        page: Option<String>,
        #[arg(long)]
        video: Option<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long, default_value = "cli")]
        viewer: String,
        /// Evaluate as an admin simulating this tier
        #[arg(long, value_enum)]
        simulate: Option<TierArg>,
    },
    /// List unread notifications
    Notifications {
        #[arg(long, value_enum, default_value = "free")]
        tier: TierArg,
    },
    /// Mark a notification read through the REST fallback
    MarkRead { id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    match args.command {
        Command::Window {
            start,
            end,
            inactive,
        } => {
            let state = evaluate(
                Utc::now(),
                parse_bound(start.as_deref()),
                parse_bound(end.as_deref()),
                !inactive,
            );
            println!("{}", state.as_str());
        }
        Command::Countdown { end, ticks } => {
            let end = parse_bound(Some(end.as_str())).context("--end is not a valid timestamp")?;
            let tick = config::load(Some(args.config.as_path()))
                .map(|cfg| cfg.countdown.tick())
                .unwrap_or_else(|_| std::time::Duration::from_secs(1));
            let mut ticker = CountdownTicker::spawn(end, tick);
            for _ in 0..ticks {
                let Some(cd) = ticker.changed().await else { break };
                let p = cd.parts;
                println!(
                    "{}d {:02}:{:02}:{:02} {}",
                    p.days,
                    p.hours,
                    p.minutes,
                    p.seconds,
                    cd.urgency.as_str()
                );
                if cd.is_expired() {
                    break;
                }
            }
        }
        Command::Popup {
            trigger,
            page,
            video,
            course,
            viewer,
            simulate,
        } => {
            let cfg = config::load(Some(args.config.as_path()))?;
            let client = PortalClient::from_config(&cfg)?;
            let ctx = TriggerContext {
                trigger: trigger.into(),
                target_page: page,
                target_video_id: video,
                target_course_id: course,
            };
            let viewer = match simulate {
                Some(tier) => ViewerContext::admin(viewer).with_simulation(Some(tier.into())),
                None => ViewerContext::viewer(viewer, Tier::Free),
            };
            let candidates = client.fetch_candidates(&ctx).await?;
            info!(count = candidates.len(), "fetched popup candidates");
            let winner = select_popup(
                &candidates,
                &ctx,
                &viewer,
                &SessionSeenSet::default(),
                &client,
                Utc::now(),
            )
            .await;
            println!("{}", serde_json::to_string_pretty(&winner)?);
        }
        Command::Notifications { tier } => {
            let cfg = config::load(Some(args.config.as_path()))?;
            let client = Arc::new(PortalClient::from_config(&cfg)?);
            let reconciler =
                Reconciler::with_rest_fallback(Arc::new(PushChannel::disconnected()), client);
            reconciler.refresh().await?;
            let viewer = ViewerContext::viewer("cli", tier.into());
            for delivery in reconciler.unread(&viewer, Utc::now()) {
                println!("{}\t{}", delivery.notification.id, delivery.notification.title);
            }
        }
        Command::MarkRead { id } => {
            let cfg = config::load(Some(args.config.as_path()))?;
            let client = Arc::new(PortalClient::from_config(&cfg)?);
            let reconciler =
                Reconciler::with_rest_fallback(Arc::new(PushChannel::disconnected()), client);
            let outcome = reconciler.mark_read(&id).await?;
            println!("{outcome:?}");
        }
    }

    Ok(())
}
