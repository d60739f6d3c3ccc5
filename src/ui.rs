use iocraft::prelude::*;
use tokio::sync::watch;

const BAR_WIDTH: usize = 40;

#[derive(Default, Props)]
pub struct ProgressBarProps {
    pub title: String,
    /// Percentage in `0.0..=100.0`
    pub progress: Option<watch::Receiver<f32>>,
}

fn render_bar(percent: f32) -> String {
    let filled = ((percent.clamp(0.0, 100.0) / 100.0) * BAR_WIDTH as f32).round() as usize;
    format!("{}{}", "█".repeat(filled), "░".repeat(BAR_WIDTH - filled))
}

#[component]
pub fn ProgressBar(props: &ProgressBarProps, mut hooks: Hooks) -> impl Into<AnyElement<'static>> {
    let mut percent = hooks.use_state(|| 0.0f32);
    let progress = props.progress.clone();

    hooks.use_future(async move {
        let Some(mut progress) = progress else {
            return;
        };
        while progress.changed().await.is_ok() {
            let value = *progress.borrow_and_update();
            percent.set(value);
        }
    });

    element! {
        View(flex_direction: FlexDirection::Column) {
            Text(weight: Weight::Bold, content: props.title.clone())
            View(flex_direction: FlexDirection::Row) {
                Text(color: Color::Cyan, content: render_bar(percent.get()))
                Text(content: format!(" {:5.1}%", percent.get()))
            }
        }
    }
}

#[derive(Default, Props)]
pub struct MessageProps {
    pub message: String,
}

#[component]
pub fn SuccessMessage(props: &MessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(color: Color::Green, content: "◆ ")
            Text(content: props.message.clone())
        }
    }
}

#[component]
pub fn ErrorMessage(props: &MessageProps) -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Row) {
            Text(color: Color::Red, content: "▲ ")
            Text(content: props.message.clone())
        }
    }
}

#[component]
pub fn ConfigHeader() -> impl Into<AnyElement<'static>> {
    element! {
        View(flex_direction: FlexDirection::Column) {
            View(flex_direction: FlexDirection::Row) {
                Text(content: "┌ ")
                View(background_color: Color::Blue) {
                    Text(content: "grab-upload configuration", color: Color::White)
                }
            }
            Text(content: "│ Press enter to accept the default shown in brackets")
        }
    }
}

#[derive(Default, Props)]
pub struct InputPromptProps {
    pub prompt: String,
    pub default: Option<String>,
    pub description: Option<String>,
}

#[component]
pub fn InputPrompt(props: &InputPromptProps) -> impl Into<AnyElement<'static>> {
    let prompt = match &props.default {
        Some(default) => format!("{} [{}]", props.prompt, default),
        None => props.prompt.clone(),
    };

    element! {
        View(flex_direction: FlexDirection::Column) {
            Text(content: "│")
            Text(weight: Weight::Bold, content: format!("◇ {}", prompt))
            #(props.description.as_ref().map(|description| element! {
                Text(color: Color::Grey, content: format!("│ {}", description))
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_bar_bounds() {
        assert_eq!(render_bar(0.0).chars().filter(|c| *c == '█').count(), 0);
        assert_eq!(render_bar(50.0).chars().filter(|c| *c == '█').count(), BAR_WIDTH / 2);
        assert_eq!(render_bar(250.0).chars().filter(|c| *c == '█').count(), BAR_WIDTH);
        assert_eq!(render_bar(-3.0).chars().count(), BAR_WIDTH);
    }
}
