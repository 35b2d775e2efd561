use crate::error::Error;

/// The shape of the underlying media: how many blocks it has and how a
/// block subdivides into pages, sectors and bytes.
///
/// Unlike the `Size512`/`Size1024`/... marker types this crate's ancestor
/// used, `Geometry` is a runtime value. Flash geometry is something you
/// discover by asking the device, not something the compiler can know in
/// advance, and every block/sector computation downstream takes a
/// `Geometry` by value or reference rather than by type parameter.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Geometry {
    pub number_of_blocks: u32,
    pub pages_per_block: u32,
    pub sectors_per_page: u32,
    pub sector_size: u32,
}

impl Geometry {
    pub fn new(
        number_of_blocks: u32,
        pages_per_block: u32,
        sectors_per_page: u32,
        sector_size: u32,
    ) -> Result<Geometry, Error> {
        if sector_size == 0 || !sector_size.is_power_of_two() {
            return Err(Error::InvalidGeometry);
        }
        if pages_per_block == 0 || sectors_per_page == 0 || number_of_blocks == 0 {
            return Err(Error::InvalidGeometry);
        }
        Ok(Geometry {
            number_of_blocks,
            pages_per_block,
            sectors_per_page,
            sector_size,
        })
    }

    pub fn sectors_per_block(&self) -> u32 {
        self.pages_per_block * self.sectors_per_page
    }

    pub fn block_size(&self) -> u32 {
        self.sectors_per_block() * self.sector_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_fields() {
        let g = Geometry::new(1024, 4, 4, 512).unwrap();
        assert_eq!(g.sectors_per_block(), 16);
        assert_eq!(g.block_size(), 16 * 512);
    }

    #[test]
    fn rejects_non_power_of_two_sector_size() {
        assert!(Geometry::new(1024, 4, 4, 500).is_err());
    }

    #[test]
    fn rejects_zero_dimensions() {
        assert!(Geometry::new(0, 4, 4, 512).is_err());
        assert!(Geometry::new(1024, 0, 4, 512).is_err());
    }
}
