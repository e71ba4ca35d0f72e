//! Media storage path conventions.
//!
//! Post media lives under `posts/{authorId}/{postId}/{photoId}`; the post's
//! namespace prefix `posts/{authorId}/{postId}` is the unit of deletion.
//! Profile images live at `profiles/{authorId}`.

use crate::model::{PostId, UserId};

/// Top-level prefix for post media.
pub const POSTS_PREFIX: &str = "posts";
/// Top-level prefix for profile images.
pub const PROFILES_PREFIX: &str = "profiles";

/// Namespace holding every media object of one post.
pub fn post_media_root(author_id: &UserId, post_id: &PostId) -> String {
    format!(
        "{POSTS_PREFIX}/{}/{}",
        sanitize_path_component(author_id.as_str()),
        sanitize_path_component(post_id.as_str())
    )
}

/// Full path of one photo inside a post's namespace.
pub fn post_photo(author_id: &UserId, post_id: &PostId, photo_id: &str) -> String {
    format!(
        "{}/{}",
        post_media_root(author_id, post_id),
        sanitize_path_component(photo_id)
    )
}

/// Path of an author's profile image.
pub fn profile_image(author_id: &UserId) -> String {
    format!(
        "{PROFILES_PREFIX}/{}",
        sanitize_path_component(author_id.as_str())
    )
}

/// Sanitize a path component to prevent separator injection and traversal.
/// Dots are allowed so file-style photo ids keep their extension.
fn sanitize_path_component(component: &str) -> String {
    component
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_post_photo_path() {
        let author = UserId::new("u1");
        let post = PostId::new("p42");
        assert_eq!(post_media_root(&author, &post), "posts/u1/p42");
        assert_eq!(post_photo(&author, &post, "a.jpg"), "posts/u1/p42/a.jpg");
    }

    #[test]
    fn test_profile_image_path() {
        assert_eq!(profile_image(&UserId::new("u1")), "profiles/u1");
    }

    #[test]
    fn test_sanitize_path_component() {
        assert_eq!(sanitize_path_component("a.jpg"), "a.jpg");
        assert_eq!(sanitize_path_component("user/other"), "user_other");
        assert_eq!(sanitize_path_component("a b"), "a_b");
        assert_eq!(sanitize_path_component("p@st"), "p_st");
    }

    #[test]
    fn test_separator_injection_is_neutralized() {
        let author = UserId::new("u1/..");
        let post = PostId::new("p1");
        assert_eq!(post_media_root(&author, &post), "posts/u1_../p1");
    }
}
