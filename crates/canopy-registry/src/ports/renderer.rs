#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderPolicy {
    Visible,
    Background,
}

/// Renderer-side resources held per terminal.
pub trait RendererPolicy: Send + Sync {
    fn apply(&self, id: &str, policy: RenderPolicy);
    fn dispose(&self, id: &str);
}

/// Policy for hosts without a renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessRenderer;

impl RendererPolicy for HeadlessRenderer {
    fn apply(&self, _id: &str, _policy: RenderPolicy) {}

    fn dispose(&self, _id: &str) {}
}
