//! The package facade: file enumeration, ordered parse phases, essence
//! probing, OV relink and the check entry point.

// Copyright 2024 Logan Wemyss
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;

use walkdir::WalkDir;

use crate::checks::Checker;
use crate::model::{
    AssetMap, CompositionPlaylist, EssenceKind, Kdm, PackingList, VolumeIndex,
};
use crate::parse;
use crate::probe::{MxfProber, NoopFontInspector};
use crate::profile::Profile;
use crate::report::CheckReport;
use crate::util::{folder_size, human_size, HashProgress};
use crate::xml::{sniff_root, NoopValidator};
use crate::{Error, PackageType, Schema};

/// A Digital Cinema Package rooted at a directory.
///
/// The tree is mutated only during [`Dcp::parse`] and the OV relink
/// phase of [`Dcp::check`]; checks observe it immutably.
#[derive(Debug)]
pub struct Dcp {
    pub path: PathBuf,
    pub kdm_path: Option<PathBuf>,
    pub pkey_path: Option<PathBuf>,

    /// Total size in bytes of every file in the package.
    pub size: u64,
    pub schema: Schema,
    pub package_type: PackageType,

    /// Every regular file in the package, sorted for determinism.
    pub list_files: Vec<PathBuf>,

    /// UUID to relative path index built from the AssetMaps.
    pub asset_index: BTreeMap<String, String>,

    pub assetmaps: Vec<AssetMap>,
    pub volindexes: Vec<VolumeIndex>,
    pub pkls: Vec<PackingList>,
    pub cpls: Vec<CompositionPlaylist>,
    pub kdms: Vec<Kdm>,

    parsed: bool,
    probed: bool,
}

impl Dcp {
    /// Creates a package handle.
    ///
    /// # Errors
    ///
    /// Returns `Err` when `path` is not a directory.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(Error::NotAFolder(path.to_path_buf()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            kdm_path: None,
            pkey_path: None,
            size: folder_size(path),
            schema: Schema::Unknown,
            package_type: PackageType::Unknown,
            list_files: Vec::new(),
            asset_index: BTreeMap::new(),
            assetmaps: Vec::new(),
            volindexes: Vec::new(),
            pkls: Vec::new(),
            cpls: Vec::new(),
            kdms: Vec::new(),
            parsed: false,
            probed: false,
        })
    }

    /// Supplies an out-of-package KDM file.
    #[must_use]
    pub fn with_kdm(mut self, kdm: impl Into<PathBuf>) -> Self {
        self.kdm_path = Some(kdm.into());
        self
    }

    /// Supplies the KDM recipient's RSA private key (PEM).
    #[must_use]
    pub fn with_private_key(mut self, pkey: impl Into<PathBuf>) -> Self {
        self.pkey_path = Some(pkey.into());
        self
    }

    /// Parses the package and, when `probe` is set, probes its MXF
    /// essence.
    ///
    /// Descriptors that fail to parse are logged and dropped; the one
    /// fatal condition is [`Error::Probe`] from a structurally
    /// impossible CPL.
    ///
    /// # Errors
    ///
    /// Returns `Err` on unrecoverable i/o failures or parse-level
    /// fatal conditions.
    pub fn parse(&mut self, prober: &dyn MxfProber, probe: bool) -> Result<(), Error> {
        if self.parsed && (self.probed || !probe) {
            return Ok(());
        }

        let start = Instant::now();
        log::info!("Probing DCP : {}", self.path.display());

        if !self.parsed {
            self.init_package_files();
            self.init_assetmap();
            self.init_volindex();
            self.init_pkl();
            self.init_cpl()?;
            self.init_kdm();
            self.parsed = true;
        }

        if probe && !self.probed {
            self.probe_assets(prober);
            for cpl in &mut self.cpls {
                parse::extract_aggregates(cpl);
            }
            self.probed = true;
        }

        log::info!(
            "Total time : {:.2} seconds",
            start.elapsed().as_secs_f64()
        );
        Ok(())
    }

    fn init_package_files(&mut self) {
        self.list_files = WalkDir::new(&self.path)
            .into_iter()
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_file())
            .map(walkdir::DirEntry::into_path)
            .collect();
        self.list_files.sort();
    }

    /// Root-level files whose basename is one of `names`.
    fn filter_files(&self, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|n| self.path.join(n))
            .filter(|candidate| self.list_files.contains(candidate))
            .collect()
    }

    /// Root-level XML files whose root element is `root_name`.
    fn filter_xml_by_root(&self, root_name: &str) -> Vec<PathBuf> {
        self.list_files
            .iter()
            .filter(|f| {
                f.extension().and_then(|e| e.to_str()) == Some("xml")
                    && f.parent() == Some(self.path.as_path())
                    && !f
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with('.'))
            })
            .filter(|f| sniff_root(f).is_some_and(|(name, _)| name == root_name))
            .cloned()
            .collect()
    }

    fn init_assetmap(&mut self) {
        for path in self.filter_files(&["ASSETMAP", "ASSETMAP.xml"]) {
            match parse::parse_assetmap(&path, &self.path) {
                Ok(am) => self.assetmaps.push(am),
                Err(e) => log::error!("{e}"),
            }
        }

        // In the improbable case of multiple AssetMaps, flatten the
        // asset index over all of them.
        for am in &self.assetmaps {
            for asset in &am.assets {
                self.asset_index
                    .insert(asset.id.clone(), asset.path.clone());
            }
        }

        // The package schema is assumed to be the AssetMap's.
        if let Some(am) = self.assetmaps.first() {
            self.schema = am.schema;
        }
    }

    fn init_volindex(&mut self) {
        for path in self.filter_files(&["VOLINDEX", "VOLINDEX.xml"]) {
            match parse::parse_volindex(&path) {
                Ok(vol) => self.volindexes.push(vol),
                Err(e) => log::error!("{e}"),
            }
        }
    }

    fn init_pkl(&mut self) {
        for path in self.filter_xml_by_root("PackingList") {
            match parse::parse_pkl(&path) {
                Ok(pkl) => self.pkls.push(pkl),
                Err(e) => log::error!("{e}"),
            }
        }

        // Resolve each PKL asset path through the AssetMap index.
        for pkl in &mut self.pkls {
            for asset in &mut pkl.assets {
                if let Some(path) = self.asset_index.get(&asset.id) {
                    asset.path = Some(path.clone());
                }
            }
        }
    }

    fn init_cpl(&mut self) -> Result<(), Error> {
        for path in self.filter_xml_by_root("CompositionPlaylist") {
            match parse::parse_cpl(&path) {
                Ok(cpl) => self.cpls.push(cpl),
                Err(fatal @ Error::Probe(_)) => return Err(fatal),
                Err(e) => log::error!("{e}"),
            }
        }

        // Back-fill the PKL referencing each CPL.
        for cpl in &mut self.cpls {
            cpl.pkl_id = self
                .pkls
                .iter()
                .find(|pkl| pkl.assets.iter().any(|a| a.id == cpl.id))
                .map(|pkl| pkl.id.clone());
        }

        // Resolve reel asset paths; any unresolved asset makes the
        // package a VF.
        self.package_type = PackageType::Ov;
        for cpl in &mut self.cpls {
            for reel in &mut cpl.reels {
                for (kind, asset) in &mut reel.assets {
                    if !EssenceKind::FILE_BACKED.contains(kind) {
                        continue;
                    }
                    if let Some(path) = self.asset_index.get(&asset.id) {
                        asset.path = path.clone();
                        asset.absolute_path = Some(self.path.join(path));
                    } else {
                        self.package_type = PackageType::Vf;
                    }
                }
            }
        }

        Ok(())
    }

    fn init_kdm(&mut self) {
        let mut paths = self.filter_xml_by_root("DCinemaSecurityMessage");
        if let Some(kdm) = &self.kdm_path {
            paths.push(kdm.clone());
        }

        for path in paths {
            match parse::parse_kdm(&path) {
                Ok(kdm) => self.kdms.push(kdm),
                Err(e) => log::error!("{e}"),
            }
        }

        if let Some(pkey) = self.pkey_path.clone() {
            if pkey.exists() {
                for kdm in &mut self.kdms {
                    if let Err(e) = parse::decrypt_kdm_keys(kdm, &pkey) {
                        log::error!("{e}");
                    }
                }
            }
        }
    }

    fn probe_assets(&mut self, prober: &dyn MxfProber) {
        for cpl in &mut self.cpls {
            for reel in &mut cpl.reels {
                for asset in reel.assets.values_mut() {
                    let Some(path) = asset.absolute_path.clone() else {
                        continue;
                    };
                    if path.extension().and_then(|e| e.to_str()) != Some("mxf") {
                        continue;
                    }

                    let stereoscopic = asset.stereoscopic.unwrap_or(false);
                    match prober.probe(&path, stereoscopic) {
                        Ok(mut record) => {
                            let is_sound = asset.kind == Some(EssenceKind::Sound);
                            let clear = record.encrypted_essence != Some(true);
                            if is_sound && clear {
                                match prober.audio_stats(
                                    &path,
                                    record.channel_count.unwrap_or(0),
                                    asset.entry_point.unwrap_or(0),
                                    asset.duration.unwrap_or(0),
                                ) {
                                    Ok(stats) => record.audio_analyze = Some(stats),
                                    Err(e) => log::info!(
                                        "audio statistics skipped for {}: {e}",
                                        path.display()
                                    ),
                                }
                            }
                            asset.probe = Some(record);
                        }
                        Err(e) => asset.probe_error = Some(e.to_string()),
                    }
                }
            }
        }
    }

    /// Relinks unresolved VF assets against an OV package: resolves
    /// their absolute paths through the OV AssetMap index and probes
    /// them from the OV location.
    pub fn relink_ov(&mut self, ov: &Dcp, prober: &dyn MxfProber) {
        for cpl in &mut self.cpls {
            for reel in &mut cpl.reels {
                for asset in reel.assets.values_mut() {
                    if !asset.path.is_empty() || asset.absolute_path.is_some() {
                        continue;
                    }
                    let Some(path_ov) = ov.asset_index.get(&asset.id) else {
                        continue;
                    };

                    let absolute = ov.path.join(path_ov);
                    asset.absolute_path = Some(absolute.clone());

                    if absolute.extension().and_then(|e| e.to_str()) == Some("mxf")
                        && absolute.is_file()
                    {
                        let stereoscopic = asset.stereoscopic.unwrap_or(false);
                        match prober.probe(&absolute, stereoscopic) {
                            Ok(record) => asset.probe = Some(record),
                            Err(e) => asset.probe_error = Some(e.to_string()),
                        }
                    }
                }
            }
            parse::extract_aggregates(cpl);
        }
    }

    /// Package files not referenced by any AssetMap entry and not an
    /// AssetMap or VolumeIndex themselves, relative to the root.
    #[must_use]
    pub fn unreferenced_files(&self) -> Vec<String> {
        let mut referenced: Vec<PathBuf> = self
            .asset_index
            .values()
            .map(|rel| self.path.join(rel))
            .collect();
        referenced.extend(self.filter_files(&["ASSETMAP", "ASSETMAP.xml"]));
        referenced.extend(self.filter_files(&["VOLINDEX", "VOLINDEX.xml"]));

        self.list_files
            .iter()
            .filter(|f| !referenced.contains(f))
            .map(|f| {
                f.strip_prefix(&self.path)
                    .unwrap_or(f)
                    .display()
                    .to_string()
            })
            .collect()
    }

    /// The content key unwrapped from a KDM for an encrypted asset, if
    /// available.
    #[must_use]
    pub fn content_key_for(&self, key_id: &str) -> Option<String> {
        self.kdms.iter().find_map(|kdm| {
            kdm.keys
                .get(key_id)
                .and_then(|key| key.info.as_ref())
                .map(|info| info.content_key.clone())
        })
    }

    /// All extracted package metadata as a JSON value, the `probe`
    /// subcommand output.
    #[must_use]
    pub fn metadata(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "DCP",
            "path": self.path.display().to_string(),
            "size": human_size(self.size),
            "schema": self.schema,
            "package_type": self.package_type,
            "count_file": self.asset_index.len(),
            "asset_list": self.asset_index,
            "assetmap_list": self.assetmaps,
            "volindex_list": self.volindexes,
            "pkl_list": self.pkls,
            "cpl_list": self.cpls,
            "kdm_list": self.kdms,
        })
    }

    /// Parses (if needed) and validates the package, returning the
    /// overall status and the report.
    ///
    /// # Errors
    ///
    /// Returns `Err` on unrecoverable i/o or parse-level fatal
    /// conditions; conformance findings land in the report instead.
    pub fn check(
        &mut self,
        prober: &dyn MxfProber,
        profile: &Profile,
        ov_path: Option<&Path>,
        hash_callback: Option<HashProgress<'_>>,
    ) -> Result<(bool, CheckReport), Error> {
        self.parse(prober, true)?;

        let ov_dcp = match ov_path {
            Some(path) => {
                let mut ov = Dcp::new(path)?;
                ov.parse(prober, true)?;
                self.relink_ov(&ov, prober);
                Some(ov)
            }
            None => None,
        };

        let start = Instant::now();
        let mut checker = Checker::new(
            &*self,
            profile,
            prober,
            &NoopValidator,
            &NoopFontInspector,
        );
        checker.ov_dcp = ov_dcp.as_ref();
        checker.hash_callback = hash_callback;

        let executions = checker.check();
        let report = CheckReport::new(self, profile, executions, start.elapsed().as_secs_f64());

        Ok((report.is_valid(), report))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::*;

    use super::*;
    use crate::probe::{MockProber, ProbeRecord};

    const INTEROP_AM_NS: &str = "http://www.digicine.com/PROTO-ASDCP-AM-20040311#";
    const INTEROP_PKL_NS: &str = "http://www.digicine.com/PROTO-ASDCP-PKL-20040311#";
    const INTEROP_CPL_NS: &str = "http://www.digicine.com/PROTO-ASDCP-CPL-20040511#";

    const PICTURE_ID: &str = "10000000-0000-1000-8000-000000000001";
    const SOUND_ID: &str = "20000000-0000-1000-8000-000000000001";
    const CPL_ID: &str = "77777777-6666-1555-8444-333333333333";
    const PKL_ID: &str = "88888888-7777-1666-8555-444444444444";

    fn write_interop_package(dir: &Path, with_essence: bool) {
        let mut am_assets = format!(
            r#"<Asset>
      <Id>urn:uuid:{PKL_ID}</Id>
      <PackingList/>
      <ChunkList><Chunk><Path>pkl.xml</Path></Chunk></ChunkList>
    </Asset>
    <Asset>
      <Id>urn:uuid:{CPL_ID}</Id>
      <ChunkList><Chunk><Path>cpl.xml</Path></Chunk></ChunkList>
    </Asset>"#
        );
        if with_essence {
            am_assets += &format!(
                r#"
    <Asset>
      <Id>urn:uuid:{PICTURE_ID}</Id>
      <ChunkList><Chunk><Path>picture.mxf</Path></Chunk></ChunkList>
    </Asset>
    <Asset>
      <Id>urn:uuid:{SOUND_ID}</Id>
      <ChunkList><Chunk><Path>sound.mxf</Path></Chunk></ChunkList>
    </Asset>"#
            );
        }

        std::fs::write(
            dir.join("ASSETMAP"),
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<AssetMap xmlns="{INTEROP_AM_NS}">
  <Id>urn:uuid:11111111-2222-1333-8444-555555555555</Id>
  <Creator>maker</Creator>
  <VolumeCount>1</VolumeCount>
  <AssetList>
    {am_assets}
  </AssetList>
</AssetMap>
"#
            ),
        )
        .unwrap();

        std::fs::write(
            dir.join("VOLINDEX"),
            "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
             <VolumeIndex xmlns=\"http://www.digicine.com/PROTO-ASDCP-VL-20040311#\">\
             <Index>1</Index></VolumeIndex>\n",
        )
        .unwrap();

        std::fs::write(
            dir.join("pkl.xml"),
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<PackingList xmlns="{INTEROP_PKL_NS}">
  <Id>urn:uuid:{PKL_ID}</Id>
  <AnnotationText>Foo_FTR_F_EN-XX_US-R_51_2K_DI_20240125_ECL_IOP_OV</AnnotationText>
  <IssueDate>2024-01-25T10:00:00+00:00</IssueDate>
  <Creator>maker</Creator>
  <AssetList>
    <Asset><Id>urn:uuid:{CPL_ID}</Id><Hash>h</Hash><Size>10</Size><Type>text/xml</Type></Asset>
  </AssetList>
</PackingList>
"#
            ),
        )
        .unwrap();

        std::fs::write(
            dir.join("cpl.xml"),
            format!(
                r#"<?xml version="1.0" encoding="UTF-8"?>
<CompositionPlaylist xmlns="{INTEROP_CPL_NS}">
  <Id>urn:uuid:{CPL_ID}</Id>
  <ContentTitleText>Foo_FTR_F_EN-XX_US-R_51_2K_DI_20240125_ECL_IOP_OV</ContentTitleText>
  <IssueDate>2024-01-25T10:00:00+00:00</IssueDate>
  <ReelList>
    <Reel>
      <Id>urn:uuid:00000000-0000-1000-8000-000000000001</Id>
      <AssetList>
        <MainPicture>
          <Id>urn:uuid:{PICTURE_ID}</Id>
          <EditRate>24 1</EditRate>
          <FrameRate>24 1</FrameRate>
          <ScreenAspectRatio>1.85</ScreenAspectRatio>
          <IntrinsicDuration>240</IntrinsicDuration>
          <EntryPoint>0</EntryPoint>
          <Duration>240</Duration>
        </MainPicture>
        <MainSound>
          <Id>urn:uuid:{SOUND_ID}</Id>
          <EditRate>24 1</EditRate>
          <IntrinsicDuration>240</IntrinsicDuration>
          <EntryPoint>0</EntryPoint>
          <Duration>240</Duration>
        </MainSound>
      </AssetList>
    </Reel>
  </ReelList>
</CompositionPlaylist>
"#
            ),
        )
        .unwrap();

        if with_essence {
            std::fs::write(dir.join("picture.mxf"), b"jp2k").unwrap();
            std::fs::write(dir.join("sound.mxf"), b"pcm").unwrap();
        }
    }

    #[rstest]
    fn interop_ov_package_parses() {
        let dir = tempfile::tempdir().unwrap();
        write_interop_package(dir.path(), true);

        let mut dcp = Dcp::new(dir.path()).unwrap();
        dcp.parse(&MockProber::new(), false).unwrap();

        assert_eq!(dcp.schema, Schema::Interop);
        assert_eq!(dcp.package_type, PackageType::Ov);
        assert_eq!(dcp.asset_index.len(), 4);
        assert_eq!(dcp.assetmaps.len(), 1);
        assert_eq!(dcp.volindexes.len(), 1);
        assert_eq!(dcp.pkls.len(), 1);
        assert_eq!(dcp.cpls.len(), 1);
        assert_eq!(dcp.cpls[0].pkl_id.as_deref(), Some(PKL_ID));

        let metadata = dcp.metadata();
        assert_eq!(metadata["schema"], serde_json::json!("Interop"));
        assert_eq!(metadata["package_type"], serde_json::json!("OV"));
        assert_eq!(metadata["count_file"], serde_json::json!(4));
    }

    #[rstest]
    fn vf_package_is_detected_and_relinks_against_ov() {
        let ov_dir = tempfile::tempdir().unwrap();
        write_interop_package(ov_dir.path(), true);

        // The VF has the same CPL but no essence files of its own.
        let vf_dir = tempfile::tempdir().unwrap();
        write_interop_package(vf_dir.path(), false);

        let mut prober = MockProber::new();
        for name in ["picture.mxf", "sound.mxf"] {
            prober.insert(
                ov_dir.path().join(name),
                ProbeRecord {
                    edit_rate: Some(24.0),
                    ..ProbeRecord::default()
                },
            );
        }

        let mut vf = Dcp::new(vf_dir.path()).unwrap();
        vf.parse(&prober, false).unwrap();
        assert_eq!(vf.package_type, PackageType::Vf);

        let mut ov = Dcp::new(ov_dir.path()).unwrap();
        ov.parse(&prober, true).unwrap();
        assert_eq!(ov.package_type, PackageType::Ov);

        vf.relink_ov(&ov, &prober);
        let picture = vf.cpls[0].reels[0]
            .asset(crate::model::EssenceKind::Picture)
            .unwrap();
        assert!(picture.absolute_path.is_some());
        assert!(picture.probe.is_some());
    }

    #[rstest]
    fn unreferenced_files_are_listed() {
        let dir = tempfile::tempdir().unwrap();
        write_interop_package(dir.path(), true);
        std::fs::write(dir.path().join("stray.txt"), b"stray").unwrap();

        let mut dcp = Dcp::new(dir.path()).unwrap();
        dcp.parse(&MockProber::new(), false).unwrap();

        assert_eq!(dcp.unreferenced_files(), vec!["stray.txt".to_owned()]);
    }

    #[rstest]
    fn check_returns_a_report() {
        let dir = tempfile::tempdir().unwrap();
        write_interop_package(dir.path(), true);

        let mut dcp = Dcp::new(dir.path()).unwrap();
        let profile = crate::profile::Profile::default();
        let (valid, report) = dcp
            .check(&MockProber::new(), &profile, None, None)
            .unwrap();

        // The canned package intentionally fails the PKL hash check.
        assert!(!valid);
        assert!(report.checks_count() > 20);
        assert!(report
            .checks
            .iter()
            .any(|c| c.name == "check_assets_pkl_hash" && c.has_errors()));
        // A VF-only check passes on this OV.
        assert!(report
            .checks
            .iter()
            .filter(|c| c.name == "check_assets_cpl_missing_from_vf")
            .all(|c| !c.has_errors()));
    }
}
