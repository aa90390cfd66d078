//! Update routing and the two conversation flows.
//!
//! Every endpoint swallows its own errors: the platform always gets a clean
//! acknowledgement, failures are logged and forwarded to the admin chat.

use crate::broadcast::{self, BroadcastReport};
use crate::config::Config;
use crate::render::Renderer;
use crate::session::{ChatState, SessionMap};
use crate::tracker::ProgressTracker;
use anyhow::{Context as _, Result};
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::time::Duration;
use teloxide::{
    dispatching::UpdateHandler,
    dptree,
    prelude::*,
    requests::{HasPayload, Payload, Request},
    types::{
        CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, InputFile, Message,
        ParseMode,
    },
    utils::command::{BotCommands, ParseError},
};
use tracing::{error, warn};

const CALLBACK_PREFIX: &str = "st";
const CB_RANDOM: &str = "st:rand";
const TOP_LIST_SIZE: usize = 5;

pub struct AppState {
    pub cfg: Config,
    pub tracker: ProgressTracker,
    pub renderer: Renderer,
    pub sessions: SessionMap,
}

#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase")]
pub enum Command {
    #[command(description = "welcome and how the rewards work")]
    Start,
    #[command(description = "your progress toward the next reward")]
    MyProgress,
    #[command(description = "top contributors")]
    Top,
    #[command(description = "create your custom image")]
    Create,
    #[command(description = "cancel the current flow")]
    Cancel,
    #[command(description = "admin: list admin actions")]
    Admin,
    #[command(description = "admin: usage statistics")]
    Stats,
    #[command(description = "admin: message every registered user")]
    Broadcast,
    #[command(rename = "check_user", parse_with = rest_of_line, description = "admin: inspect one user")]
    CheckUser(String),
}

// Accept a bare `/check_user` too, so the handler can answer with usage
// instead of the update silently missing the command branch.
fn rest_of_line(input: String) -> Result<(String,), ParseError> {
    Ok((input.trim().to_string(),))
}

fn ctx_perm_hint(ctx: &str) -> &'static str {
    match ctx {
        "send_message" => "the user may not have started the bot, or has blocked it",
        "send_photo" => "the bot must be allowed to send media; the user may have blocked it",
        "answer_callback_query" => "callback acknowledgements rarely fail; usually a network error",
        _ => "check that the bot is still in the chat and has the needed rights",
    }
}

async fn api_log<R>(ctx: &str, req: R) -> Option<<R::Payload as Payload>::Output>
where
    R: Request + HasPayload,
{
    match req.send().await {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(
                "API call failed ({ctx}): {:?}; hint: {}",
                e,
                ctx_perm_hint(ctx)
            );
            None
        }
    }
}

async fn notify_admin(bot: &Bot, state: &AppState, text: String) {
    let admin = ChatId(state.cfg.bot.admin_id as i64);
    let _ = api_log("send_message", bot.send_message(admin, text)).await;
}

async fn report_internal_error(bot: &Bot, state: &AppState, scope: &str, err: &anyhow::Error) {
    error!("{} failed: {:?}", scope, err);
    notify_admin(
        bot,
        state,
        format!("⚠️ Internal error in {}:\n{:?}", scope, err),
    )
    .await;
}

// ---------------------------------------------------------------------------
// Style gallery
// ---------------------------------------------------------------------------

fn style_label(style: &str) -> String {
    match style.strip_prefix("style") {
        Some(n) => format!("Style {}", n),
        None => style.to_string(),
    }
}

fn page_count(style_count: usize, per_page: usize) -> usize {
    style_count.div_ceil(per_page)
}

fn cb_pick(style: &str) -> String {
    format!("{}:pick:{}", CALLBACK_PREFIX, style)
}

fn cb_page(page: usize) -> String {
    format!("{}:page:{}", CALLBACK_PREFIX, page)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum StyleAction {
    Page(usize),
    Pick(String),
    Random,
}

fn parse_callback_data(data: &str) -> Option<StyleAction> {
    if data == CB_RANDOM {
        return Some(StyleAction::Random);
    }
    let parts: Vec<&str> = data.splitn(3, ':').collect();
    if parts.len() != 3 || parts[0] != CALLBACK_PREFIX {
        return None;
    }
    match parts[1] {
        "page" => parts[2].parse::<usize>().ok().map(StyleAction::Page),
        "pick" => Some(StyleAction::Pick(parts[2].to_string())),
        _ => None,
    }
}

fn style_keyboard(styles: &[String], page: usize, per_page: usize) -> InlineKeyboardMarkup {
    let pages = page_count(styles.len(), per_page);
    let start = (page - 1) * per_page;
    let end = (start + per_page).min(styles.len());

    let mut rows: Vec<Vec<InlineKeyboardButton>> = styles[start..end]
        .chunks(2)
        .map(|pair| {
            pair.iter()
                .map(|s| InlineKeyboardButton::callback(style_label(s), cb_pick(s)))
                .collect()
        })
        .collect();

    let mut nav = Vec::new();
    if page > 1 {
        nav.push(InlineKeyboardButton::callback("⬅️ Back", cb_page(page - 1)));
    }
    if page < pages {
        nav.push(InlineKeyboardButton::callback("More ➡️", cb_page(page + 1)));
    }
    if !nav.is_empty() {
        rows.push(nav);
    }
    rows.push(vec![InlineKeyboardButton::callback(
        "🎲 Surprise me",
        CB_RANDOM.to_string(),
    )]);

    InlineKeyboardMarkup::new(rows)
}

async fn send_style_gallery(bot: &Bot, state: &AppState, chat_id: ChatId, page: usize) {
    let styles = state.renderer.style_ids();
    let per_page = state.cfg.rewards.styles_per_page;
    let pages = page_count(styles.len(), per_page);
    let kb = style_keyboard(&styles, page, per_page);
    let caption = format!("Choose a style for your image (page {}/{}):", page, pages);

    let preview = state.renderer.preview_path(page);
    if preview.exists() {
        let _ = api_log(
            "send_photo",
            bot.send_photo(chat_id, InputFile::file(preview))
                .caption(caption)
                .reply_markup(kb),
        )
        .await;
    } else {
        let _ = api_log(
            "send_message",
            bot.send_message(chat_id, caption).reply_markup(kb),
        )
        .await;
    }
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

fn is_admin(state: &AppState, user_id: u64) -> bool {
    user_id == state.cfg.bot.admin_id
}

async fn handle_command(bot: &Bot, state: &Arc<AppState>, msg: &Message, cmd: Command) -> Result<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let uid = from.id.0;
    let chat_id = msg.chat.id;
    let threshold = state.tracker.threshold();

    match cmd {
        Command::Start => {
            state.tracker.register_user(uid).await?;
            let _ = api_log(
                "send_message",
                bot.send_message(
                    chat_id,
                    format!(
                        "👋 <b>Welcome!</b>\n\nThis bot lets you create custom profile pictures \
                         by contributing to our community.\n\nAdd <b>{} members</b> to the group, \
                         then send me /create in this private chat.\n\nUse /myprogress to check \
                         your status and /top to see the top contributors!",
                        threshold
                    ),
                )
                .parse_mode(ParseMode::Html),
            )
            .await;
        }
        Command::MyProgress => {
            let count = state.tracker.progress(uid);
            let mut text = format!(
                "📈 Your current progress: <b>{}/{}</b> members added.",
                count, threshold
            );
            if state.tracker.is_eligible(uid) {
                text.push_str("\n\n🎁 You have an unclaimed reward — send /create!");
            }
            let _ = api_log(
                "send_message",
                bot.send_message(chat_id, text).parse_mode(ParseMode::Html),
            )
            .await;
        }
        Command::Top => {
            let _ = api_log(
                "send_message",
                bot.send_message(chat_id, top_list_text(state)).parse_mode(ParseMode::Html),
            )
            .await;
        }
        Command::Create => {
            if !msg.chat.is_private() {
                let _ = api_log(
                    "send_message",
                    bot.send_message(chat_id, "Send me /create in a private chat to claim your reward."),
                )
                .await;
                return Ok(());
            }
            if !state.tracker.is_eligible(uid) {
                let count = state.tracker.progress(uid);
                let _ = api_log(
                    "send_message",
                    bot.send_message(
                        chat_id,
                        format!(
                            "🔒 Not yet! You need to add <b>{}</b> members to unlock this \
                             feature. Current progress: <b>{}/{}</b>.",
                            threshold, count, threshold
                        ),
                    )
                    .parse_mode(ParseMode::Html),
                )
                .await;
                return Ok(());
            }
            state.sessions.set(uid, ChatState::ChoosingStyle { page: 1 });
            send_style_gallery(bot, state, chat_id, 1).await;
        }
        Command::Cancel => {
            let text = if state.sessions.clear(uid) {
                "Cancelled. Nothing was saved."
            } else {
                "Nothing to cancel."
            };
            let _ = api_log("send_message", bot.send_message(chat_id, text)).await;
        }
        Command::Admin => {
            if !is_admin(state, uid) {
                return Ok(());
            }
            let _ = api_log(
                "send_message",
                bot.send_message(
                    chat_id,
                    "🛠 <b>Admin actions</b>\n\
                     /stats — total registered users\n\
                     /broadcast — message every registered user\n\
                     /check_user &lt;id&gt; — one user's counters and eligibility",
                )
                .parse_mode(ParseMode::Html),
            )
            .await;
        }
        Command::Stats => {
            if !is_admin(state, uid) {
                return Ok(());
            }
            let _ = api_log(
                "send_message",
                bot.send_message(
                    chat_id,
                    format!("👥 Registered users: <b>{}</b>", state.tracker.registered_count()),
                )
                .parse_mode(ParseMode::Html),
            )
            .await;
        }
        Command::Broadcast => {
            if !is_admin(state, uid) || !msg.chat.is_private() {
                return Ok(());
            }
            state.sessions.set(uid, ChatState::AwaitingBroadcastText);
            let _ = api_log(
                "send_message",
                bot.send_message(
                    chat_id,
                    "Send me the message to broadcast, or /cancel to abort.",
                ),
            )
            .await;
        }
        Command::CheckUser(arg) => {
            if !is_admin(state, uid) {
                return Ok(());
            }
            let text = match arg.trim().parse::<u64>() {
                Ok(target) => {
                    let count = state.tracker.progress(target);
                    let lifetime = state
                        .tracker
                        .leaderboard_entry(target)
                        .map(|e| format!("{} ({})", e.count, e.name))
                        .unwrap_or_else(|| "0".to_string());
                    format!(
                        "🔎 User {}\nProgress: {}/{}\nLifetime invites: {}\nEligible: {}",
                        target,
                        count,
                        threshold,
                        lifetime,
                        if state.tracker.is_eligible(target) { "yes" } else { "no" }
                    )
                }
                Err(_) => "Usage: /check_user <id>".to_string(),
            };
            let _ = api_log("send_message", bot.send_message(chat_id, text)).await;
        }
    }
    Ok(())
}

fn top_list_text(state: &AppState) -> String {
    let top = state.tracker.top(TOP_LIST_SIZE);
    if top.is_empty() {
        return "No contributors yet — add members to the group to get on the board!".to_string();
    }
    let mut lines = vec!["🏆 <b>Top contributors</b>".to_string()];
    for (rank, (_, entry)) in top.iter().enumerate() {
        let badge = match rank {
            0 => "🥇".to_string(),
            1 => "🥈".to_string(),
            2 => "🥉".to_string(),
            r => format!("{}.", r + 1),
        };
        lines.push(format!("{} {} — {}", badge, entry.name, entry.count));
    }
    lines.join("\n")
}

// ---------------------------------------------------------------------------
// Membership events
// ---------------------------------------------------------------------------

async fn handle_new_members(bot: &Bot, state: &Arc<AppState>, msg: &Message) -> Result<()> {
    if msg.chat.id != ChatId(state.cfg.bot.group_id) {
        return Ok(());
    }
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let members = msg.new_chat_members().unwrap_or(&[]);
    // self-joins and added bots do not count toward the reward
    let added = members.iter().filter(|u| u.id != from.id && !u.is_bot).count() as u32;
    if added == 0 {
        return Ok(());
    }

    let outcome = state
        .tracker
        .record_invites(from.id.0, &from.full_name(), added)
        .await?;

    let threshold = state.tracker.threshold();
    let text = if outcome.became_eligible {
        format!(
            "🎉 {} just reached <b>{}</b> invites and unlocked a custom profile picture! \
             DM me /create to claim it.",
            from.full_name(),
            threshold
        )
    } else {
        format!(
            "📈 {}: <b>{}/{}</b> members added.",
            from.full_name(),
            outcome.count,
            threshold
        )
    };
    let _ = api_log(
        "send_message",
        bot.send_message(msg.chat.id, text).parse_mode(ParseMode::Html),
    )
    .await;
    Ok(())
}

// ---------------------------------------------------------------------------
// Private free text (the non-command half of both flows)
// ---------------------------------------------------------------------------

async fn handle_private_text(bot: &Bot, state: &Arc<AppState>, msg: &Message) -> Result<()> {
    let Some(from) = msg.from.as_ref() else {
        return Ok(());
    };
    let uid = from.id.0;
    let text = msg.text().unwrap_or("");
    if text.trim().is_empty() || text.starts_with('/') {
        return Ok(());
    }

    match state.sessions.get(uid) {
        None => Ok(()),
        Some(ChatState::ChoosingStyle { .. }) => {
            let _ = api_log(
                "send_message",
                bot.send_message(
                    msg.chat.id,
                    "Please pick a style with the buttons above, or /cancel.",
                ),
            )
            .await;
            Ok(())
        }
        Some(ChatState::TypingName { style }) => {
            state.sessions.clear(uid);
            finish_create(bot, state, msg, uid, style, text).await
        }
        Some(ChatState::AwaitingBroadcastText) => {
            state
                .sessions
                .set(uid, ChatState::AwaitingConfirmation { draft: text.to_string() });
            let _ = api_log(
                "send_message",
                bot.send_message(
                    msg.chat.id,
                    format!(
                        "📣 Preview:\n\n{}\n\nSend to {} registered user(s)? Reply \"yes\" to \
                         send; anything else cancels.",
                        text,
                        state.tracker.registered_count()
                    ),
                ),
            )
            .await;
            Ok(())
        }
        Some(ChatState::AwaitingConfirmation { draft }) => {
            state.sessions.clear(uid);
            if text.trim().eq_ignore_ascii_case("yes") {
                run_broadcast(bot, state, msg.chat.id, draft).await;
            } else {
                let _ = api_log(
                    "send_message",
                    bot.send_message(msg.chat.id, "Broadcast cancelled — nothing was sent."),
                )
                .await;
            }
            Ok(())
        }
    }
}

/// Applies the reward rule to a render result: a successful render is
/// delivered and the eligibility entry consumed; a failed render reports the
/// reason and leaves the eligibility entry untouched.
async fn settle_render<T, D, DFut, C, CFut, N, NFut>(
    rendered: Result<T>,
    deliver: D,
    consume: C,
    report_failure: N,
) -> Result<()>
where
    D: FnOnce(T) -> DFut,
    DFut: std::future::Future<Output = ()>,
    C: FnOnce() -> CFut,
    CFut: std::future::Future<Output = Result<()>>,
    N: FnOnce(String) -> NFut,
    NFut: std::future::Future<Output = ()>,
{
    match rendered {
        Ok(card) => {
            deliver(card).await;
            consume().await?;
        }
        Err(e) => {
            report_failure(e.to_string()).await;
        }
    }
    Ok(())
}

async fn finish_create(
    bot: &Bot,
    state: &Arc<AppState>,
    msg: &Message,
    uid: u64,
    style: String,
    name: &str,
) -> Result<()> {
    let _ = api_log(
        "send_message",
        bot.send_message(msg.chat.id, "Awesome! Creating your image now, please wait..."),
    )
    .await;

    let st = state.clone();
    let owned_name = name.to_string();
    let rendered =
        tokio::task::spawn_blocking(move || st.renderer.render(&owned_name, &style)).await?;

    settle_render(
        rendered,
        |card| async move {
            let _ = api_log(
                "send_photo",
                bot.send_photo(msg.chat.id, InputFile::file(card.path().to_path_buf()))
                    .caption(format!("Here is your masterpiece for '{}'!", name)),
            )
            .await;
            // `card` drops here and removes the scratch file
        },
        || async { state.tracker.consume_eligibility(uid).await },
        |reason| async move {
            let _ = api_log(
                "send_message",
                bot.send_message(
                    msg.chat.id,
                    "Sorry, an error occurred while creating your image. The admin has been notified.",
                ),
            )
            .await;
            notify_admin(
                bot,
                state,
                format!(
                    "⚠️ Image generation failed!\n\nUser: {} ({})\nError: {}",
                    msg.from.as_ref().map(|u| u.full_name()).unwrap_or_default(),
                    uid,
                    reason
                ),
            )
            .await;
        },
    )
    .await
}

async fn run_broadcast(bot: &Bot, state: &Arc<AppState>, report_to: ChatId, draft: String) {
    let recipients = state.tracker.registered_users();
    let delay = Duration::from_millis(state.cfg.broadcast.delay_ms);
    let _ = api_log(
        "send_message",
        bot.send_message(report_to, format!("Broadcasting to {} user(s)...", recipients.len())),
    )
    .await;

    let sender = bot.clone();
    let report: BroadcastReport = broadcast::deliver_all(&recipients, delay, |user_id| {
        let bot = sender.clone();
        let text = draft.clone();
        async move {
            api_log("send_message", bot.send_message(ChatId(user_id as i64), text))
                .await
                .is_some()
        }
    })
    .await;

    let _ = api_log(
        "send_message",
        bot.send_message(
            report_to,
            format!("📣 Broadcast complete: sent {}, failed {}.", report.sent, report.failed),
        ),
    )
    .await;
}

// ---------------------------------------------------------------------------
// Callback queries (style gallery buttons)
// ---------------------------------------------------------------------------

async fn handle_callback(bot: &Bot, state: &Arc<AppState>, q: CallbackQuery) -> Result<()> {
    let uid = q.from.id.0;
    let chat_id = q
        .message
        .as_ref()
        .map(|m| m.chat().id)
        .unwrap_or(ChatId(uid as i64));

    let Some(action) = q.data.as_deref().and_then(parse_callback_data) else {
        let _ = api_log("answer_callback_query", bot.answer_callback_query(q.id)).await;
        return Ok(());
    };

    if !matches!(state.sessions.get(uid), Some(ChatState::ChoosingStyle { .. })) {
        let _ = api_log(
            "answer_callback_query",
            bot.answer_callback_query(q.id)
                .text("This menu has expired. Send /create to start again."),
        )
        .await;
        return Ok(());
    }

    match action {
        StyleAction::Page(page) => {
            let pages = page_count(state.renderer.style_ids().len(), state.cfg.rewards.styles_per_page);
            let page = page.clamp(1, pages.max(1));
            state.sessions.set(uid, ChatState::ChoosingStyle { page });
            let _ = api_log("answer_callback_query", bot.answer_callback_query(q.id)).await;
            send_style_gallery(bot, state, chat_id, page).await;
        }
        StyleAction::Pick(style) => {
            if !state.renderer.has_style(&style) {
                let _ = api_log(
                    "answer_callback_query",
                    bot.answer_callback_query(q.id).text("That style no longer exists."),
                )
                .await;
                return Ok(());
            }
            begin_typing_name(bot, state, uid, chat_id, q, style).await;
        }
        StyleAction::Random => {
            let styles = state.renderer.style_ids();
            let style = styles
                .choose(&mut rand::thread_rng())
                .cloned()
                .context("style catalog is empty")?;
            begin_typing_name(bot, state, uid, chat_id, q, style).await;
        }
    }
    Ok(())
}

async fn begin_typing_name(
    bot: &Bot,
    state: &Arc<AppState>,
    uid: u64,
    chat_id: ChatId,
    q: CallbackQuery,
    style: String,
) {
    state.sessions.set(uid, ChatState::TypingName { style: style.clone() });
    let _ = api_log(
        "answer_callback_query",
        bot.answer_callback_query(q.id).text("Style selected!"),
    )
    .await;
    let _ = api_log(
        "send_message",
        bot.send_message(
            chat_id,
            format!(
                "Great choice — {}! Now send me the name you want on the image.",
                style_label(&style)
            ),
        ),
    )
    .await;
}

// ---------------------------------------------------------------------------
// Dispatch schema
// ---------------------------------------------------------------------------

pub fn schema() -> UpdateHandler<anyhow::Error> {
    dptree::entry()
        .branch(
            Update::filter_message().filter_command::<Command>().endpoint(
                |bot: Bot, state: Arc<AppState>, msg: Message, cmd: Command| async move {
                    if let Err(e) = handle_command(&bot, &state, &msg, cmd).await {
                        report_internal_error(&bot, &state, "command handler", &e).await;
                    }
                    Ok(())
                },
            ),
        )
        .branch(
            Update::filter_message().endpoint(
                |bot: Bot, state: Arc<AppState>, msg: Message| async move {
                    if msg.new_chat_members().is_some() {
                        if let Err(e) = handle_new_members(&bot, &state, &msg).await {
                            report_internal_error(&bot, &state, "membership handler", &e).await;
                        }
                    } else if msg.chat.is_private() {
                        if let Err(e) = handle_private_text(&bot, &state, &msg).await {
                            report_internal_error(&bot, &state, "conversation handler", &e).await;
                        }
                    }
                    Ok(())
                },
            ),
        )
        .branch(
            Update::filter_callback_query().endpoint(
                |bot: Bot, state: Arc<AppState>, q: CallbackQuery| async move {
                    if let Err(e) = handle_callback(&bot, &state, q).await {
                        report_internal_error(&bot, &state, "callback handler", &e).await;
                    }
                    Ok(())
                },
            ),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use teloxide::types::InlineKeyboardButtonKind;

    #[test]
    fn callback_data_round_trips() {
        assert_eq!(parse_callback_data(&cb_page(2)), Some(StyleAction::Page(2)));
        assert_eq!(
            parse_callback_data(&cb_pick("style3")),
            Some(StyleAction::Pick("style3".to_string()))
        );
        assert_eq!(parse_callback_data(CB_RANDOM), Some(StyleAction::Random));
    }

    #[test]
    fn foreign_callback_data_is_rejected() {
        assert_eq!(parse_callback_data(""), None);
        assert_eq!(parse_callback_data("v:123:1"), None);
        assert_eq!(parse_callback_data("st:page:notanumber"), None);
        assert_eq!(parse_callback_data("st:bogus:style1"), None);
    }

    #[test]
    fn page_counts() {
        assert_eq!(page_count(8, 4), 2);
        assert_eq!(page_count(9, 4), 3);
        assert_eq!(page_count(3, 4), 1);
    }

    #[test]
    fn style_labels_are_human_readable() {
        assert_eq!(style_label("style3"), "Style 3");
        assert_eq!(style_label("custom"), "custom");
    }

    fn button_data(kb: &InlineKeyboardMarkup) -> Vec<Vec<String>> {
        kb.inline_keyboard
            .iter()
            .map(|row| {
                row.iter()
                    .map(|b| match &b.kind {
                        InlineKeyboardButtonKind::CallbackData(d) => d.clone(),
                        _ => panic!("expected callback button"),
                    })
                    .collect()
            })
            .collect()
    }

    #[test]
    fn first_page_keyboard_has_styles_nav_and_random() {
        let styles: Vec<String> = (1..=8).map(|i| format!("style{}", i)).collect();
        let data = button_data(&style_keyboard(&styles, 1, 4));
        // 4 styles in rows of two, then nav, then random
        assert_eq!(data[0], vec![cb_pick("style1"), cb_pick("style2")]);
        assert_eq!(data[1], vec![cb_pick("style3"), cb_pick("style4")]);
        assert_eq!(data[2], vec![cb_page(2)]);
        assert_eq!(data[3], vec![CB_RANDOM.to_string()]);
    }

    #[test]
    fn last_page_keyboard_navigates_backwards_only() {
        let styles: Vec<String> = (1..=8).map(|i| format!("style{}", i)).collect();
        let data = button_data(&style_keyboard(&styles, 2, 4));
        assert_eq!(data[0], vec![cb_pick("style5"), cb_pick("style6")]);
        assert_eq!(data[2], vec![cb_page(1)]);
    }

    #[test]
    fn commands_parse() {
        assert_eq!(Command::parse("/start", "bot").unwrap(), Command::Start);
        assert_eq!(Command::parse("/myprogress", "bot").unwrap(), Command::MyProgress);
        assert_eq!(
            Command::parse("/check_user 42", "bot").unwrap(),
            Command::CheckUser("42".to_string())
        );
        // bare /check_user still reaches the handler, which answers with usage
        assert_eq!(
            Command::parse("/check_user", "bot").unwrap(),
            Command::CheckUser(String::new())
        );
    }

    #[tokio::test]
    async fn eligibility_consumed_only_on_successful_render() {
        use std::path::PathBuf;
        use std::sync::atomic::{AtomicBool, Ordering};

        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::store::DocumentStore::new(dir.path()));
        let tracker = ProgressTracker::new(store, 2);

        tracker.record_invites(1, "Ann", 2).await.unwrap();
        assert!(tracker.is_eligible(1));

        let delivered = AtomicBool::new(false);
        settle_render(
            Ok(PathBuf::from("card_for_Abel.png")),
            |_card| async {
                delivered.store(true, Ordering::SeqCst);
            },
            || async { tracker.consume_eligibility(1).await },
            |_reason: String| async {
                panic!("failure path must not run on a successful render");
            },
        )
        .await
        .unwrap();
        assert!(delivered.load(Ordering::SeqCst));
        assert!(!tracker.is_eligible(1));

        // a failed render reports the reason and leaves the reward unclaimed
        tracker.record_invites(1, "Ann", 2).await.unwrap();
        assert!(tracker.is_eligible(1));

        let reported = std::sync::Mutex::new(String::new());
        settle_render(
            Err(anyhow::anyhow!("font 'arial.ttf' not found")),
            |_card: PathBuf| async {
                panic!("delivery must not run on a failed render");
            },
            || async {
                panic!("consume must not run on a failed render");
            },
            |reason| {
                let reported = &reported;
                async move {
                    *reported.lock().unwrap() = reason;
                }
            },
        )
        .await
        .unwrap();
        assert!(tracker.is_eligible(1));
        assert!(reported.lock().unwrap().contains("not found"));
    }

    #[test]
    fn top_list_formats_badges() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(crate::store::DocumentStore::new(dir.path()));
        let state = AppState {
            cfg: Config::default(),
            tracker: ProgressTracker::new(store, 10),
            renderer: Renderer::new(crate::render::RenderConfig {
                assets_dir: dir.path().to_path_buf(),
                scratch_dir: dir.path().to_path_buf(),
                watermark_text: None,
                style_count: 8,
            }),
            sessions: SessionMap::new(30),
        };
        assert!(top_list_text(&state).contains("No contributors yet"));

        let rt = tokio::runtime::Runtime::new().unwrap();
        rt.block_on(async {
            state.tracker.record_invites(1, "Ann", 5).await.unwrap();
            state.tracker.record_invites(2, "Bob", 3).await.unwrap();
        });
        let text = top_list_text(&state);
        assert!(text.contains("🥇 Ann — 5"));
        assert!(text.contains("🥈 Bob — 3"));
    }
}
