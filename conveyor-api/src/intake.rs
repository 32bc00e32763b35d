//! How external items become packages.

/// Builds the payload of a package from an external item.
///
/// Returns `None` when the item lacks the data needed to identify it; such
/// items never enter the pipeline.
pub trait PackageFactory<I, T>: Send + Sync + 'static {
    fn build(&self, item: &I) -> Option<T>;
}

impl<I, T, F> PackageFactory<I, T> for F
where
    F: Fn(&I) -> Option<T> + Send + Sync + 'static,
{
    fn build(&self, item: &I) -> Option<T> {
        self(item)
    }
}

/// Admission check run before an item is turned into a package.
pub trait Filter<I>: Send + Sync + 'static {
    fn admit(&self, item: &I) -> bool;
}

impl<I, F> Filter<I> for F
where
    F: Fn(&I) -> bool + Send + Sync + 'static,
{
    fn admit(&self, item: &I) -> bool {
        self(item)
    }
}
