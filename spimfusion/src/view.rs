use crate::affine_model::AffineModel3D;
use crate::error::{Error, Result};
use crate::volume::Volume;
use std::fmt;
use std::sync::Arc;

/// Identifies one acquisition: which channel, stage angle, timepoint and
/// illumination direction it was recorded with.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct ViewId {
    pub channel: usize,
    pub angle: i32,
    pub timepoint: i32,
    pub illumination: usize,
}

impl fmt::Display for ViewId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "angle {} / channel {} / illumination {} / timepoint {}",
            self.angle, self.channel, self.illumination, self.timepoint
        )
    }
}

/// What the registration stage reported about a view.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct RegistrationStats {
    /// Views this one was matched against in the error statistics.
    pub connected_views: usize,
    /// Tiles connected to this view's tile in the global optimisation.
    pub connected_tiles: usize,
    /// Whether this view took part in fitting the registration.
    pub used_for_registration: bool,
}

impl RegistrationStats {
    /// Number of registration connections (the larger of both counters).
    pub fn connections(&self) -> usize {
        self.connected_views.max(self.connected_tiles)
    }
}

/// Supplies the pixels of a view on demand.
///
/// Fusion calls [`VolumeSource::load`] only for the views of the active batch and
/// drops the returned handle once the batch is done, so a source backed by disk can
/// keep resident memory bounded to one batch.
pub trait VolumeSource: Send + Sync {
    fn load(&self) -> Result<Arc<Volume>>;
}

/// A source whose image already sits in memory.
#[derive(Debug, Clone)]
pub struct InMemorySource {
    volume: Arc<Volume>,
}

impl InMemorySource {
    pub fn new(volume: Volume) -> Self {
        InMemorySource {
            volume: Arc::new(volume),
        }
    }
}

impl VolumeSource for InMemorySource {
    fn load(&self) -> Result<Arc<Volume>> {
        Ok(Arc::clone(&self.volume))
    }
}

/// One registered acquisition. Views are read-only inputs to fusion.
pub struct View {
    pub id: ViewId,
    pub name: String,
    /// Maps this view's voxel coordinates into the common frame.
    pub model: AffineModel3D,
    pub registration: RegistrationStats,
    dimensions: [usize; 3],
    source: Box<dyn VolumeSource>,
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("dimensions", &self.dimensions)
            .field("registration", &self.registration)
            .finish()
    }
}

impl View {
    /// Creates a view over an arbitrary pixel source. `dimensions` must match the
    /// volume the source delivers; this is checked on every load.
    pub fn new(
        id: ViewId,
        name: impl Into<String>,
        dimensions: [usize; 3],
        model: AffineModel3D,
        registration: RegistrationStats,
        source: Box<dyn VolumeSource>,
    ) -> Self {
        View {
            id,
            name: name.into(),
            model,
            registration,
            dimensions,
            source,
        }
    }

    /// Creates a view whose image is already in memory.
    ///
    /// # Examples
    /// ```
    /// # use spimfusion::affine_model::AffineModel3D;
    /// # use spimfusion::view::{RegistrationStats, View, ViewId};
    /// # use spimfusion::volume::Volume;
    /// let view = View::in_memory(
    ///     ViewId::default(),
    ///     "angle0",
    ///     Volume::filled([4, 4, 4], 1.0).unwrap(),
    ///     AffineModel3D::identity(),
    ///     RegistrationStats::default(),
    /// );
    /// assert_eq!(view.dimensions(), [4, 4, 4]);
    /// assert_eq!(view.load().unwrap().sum(), 64.0);
    /// ```
    pub fn in_memory(
        id: ViewId,
        name: impl Into<String>,
        volume: Volume,
        model: AffineModel3D,
        registration: RegistrationStats,
    ) -> Self {
        let dimensions = volume.dimensions();
        Self::new(
            id,
            name,
            dimensions,
            model,
            registration,
            Box::new(InMemorySource::new(volume)),
        )
    }

    /// Size of the view's image, available without loading it.
    pub fn dimensions(&self) -> [usize; 3] {
        self.dimensions
    }

    /// Loads the view's image from its source.
    ///
    /// # Errors
    /// [`Error::ViewLoad`] if the source fails or delivers a volume of unexpected size.
    pub fn load(&self) -> Result<Arc<Volume>> {
        let volume = self.source.load().map_err(|e| Error::ViewLoad {
            view: self.name.clone(),
            reason: e.to_string(),
        })?;
        if volume.dimensions() != self.dimensions {
            return Err(Error::ViewLoad {
                view: self.name.clone(),
                reason: format!(
                    "expected dimensions {:?}, source delivered {:?}",
                    self.dimensions,
                    volume.dimensions()
                ),
            });
        }
        Ok(volume)
    }
}

/// Decides which of `channel_views` take part in fusion.
///
/// A view is eligible when it has at least one registration connection, or when it
/// is the only view of the whole dataset (`all_views`). A view that was not used for
/// registration also becomes eligible when some view of the dataset with the same
/// angle and timepoint was used for registration and is connected itself; such views
/// (other channels or illuminations of a registered stack) inherit its registration.
pub fn eligible_views(channel_views: &[&View], all_views: &[View]) -> Vec<bool> {
    let sole_view = all_views.len() == 1;
    channel_views
        .iter()
        .map(|view| {
            if view.registration.connections() > 0 || sole_view {
                return true;
            }
            !view.registration.used_for_registration
                && all_views.iter().any(|other| {
                    other.id.angle == view.id.angle
                        && other.id.timepoint == view.id.timepoint
                        && other.registration.used_for_registration
                        && other.registration.connections() > 0
                })
        })
        .collect()
}
