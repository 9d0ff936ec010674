/// Optional online lookup of movie titles.
///
/// Lookups run on catalog workers only when no scan or probe work is
/// queued. The returned identifier (an IMDb id, say) is stored in the movie
/// row; `None` is recorded as "looked up, no match" so the title is not
/// retried on every start.
pub trait TitleMatcher: Send + Sync {
    fn find_match(&self, title: &str) -> Option<String>;
}
