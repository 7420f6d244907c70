use aws_sdk_ec2::error::ProvideErrorMetadata;
use aws_sdk_ec2::types::{
    Filter, IpPermission, IpRange, ResourceType, Tag, TagSpecification, UserIdGroupPair,
};
use tracing::{debug, info};

use crate::error::Result;
use crate::model::{ManagedSecurityGroup, RESOURCE_TAG, SgPeer, SgRule};

/// One security-group permission in comparable form. AWS permissions fan out
/// over ranges and referenced groups; observed state is expanded into these
/// before diffing.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct Permission {
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    pub peer: PermissionPeer,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum PermissionPeer {
    Cidr(String),
    Group(String),
}

/// Resolves model rules into concrete permissions; `FrontendSg` becomes the
/// managed group's ID.
pub fn resolve_rules(rules: &[SgRule], frontend_sg: &str) -> Vec<Permission> {
    let mut out: Vec<Permission> = rules
        .iter()
        .map(|rule| Permission {
            protocol: rule.protocol.clone(),
            from_port: rule.from_port,
            to_port: rule.to_port,
            peer: match &rule.peer {
                SgPeer::IpBlock(cidr) => PermissionPeer::Cidr(cidr.clone()),
                SgPeer::FrontendSg => PermissionPeer::Group(frontend_sg.to_string()),
            },
        })
        .collect();
    out.sort();
    out.dedup();
    out
}

pub fn expand_aws_permissions(permissions: &[IpPermission]) -> Vec<Permission> {
    let mut out = Vec::new();
    for permission in permissions {
        let protocol = permission.ip_protocol().unwrap_or_default().to_string();
        let from_port = permission.from_port().unwrap_or_default();
        let to_port = permission.to_port().unwrap_or_default();
        for range in permission.ip_ranges() {
            if let Some(cidr) = range.cidr_ip() {
                out.push(Permission {
                    protocol: protocol.clone(),
                    from_port,
                    to_port,
                    peer: PermissionPeer::Cidr(cidr.to_string()),
                });
            }
        }
        for pair in permission.user_id_group_pairs() {
            if let Some(group) = pair.group_id() {
                out.push(Permission {
                    protocol: protocol.clone(),
                    from_port,
                    to_port,
                    peer: PermissionPeer::Group(group.to_string()),
                });
            }
        }
    }
    out.sort();
    out.dedup();
    out
}

/// `(authorize, revoke)` under set semantics.
pub fn diff_permissions(
    desired: &[Permission],
    current: &[Permission],
) -> (Vec<Permission>, Vec<Permission>) {
    let authorize = desired
        .iter()
        .filter(|p| !current.contains(p))
        .cloned()
        .collect();
    let revoke = current
        .iter()
        .filter(|p| !desired.contains(p))
        .cloned()
        .collect();
    (authorize, revoke)
}

fn to_ip_permission(permission: &Permission) -> IpPermission {
    let builder = IpPermission::builder()
        .ip_protocol(&permission.protocol)
        .from_port(permission.from_port)
        .to_port(permission.to_port);
    match &permission.peer {
        PermissionPeer::Cidr(cidr) => {
            builder.ip_ranges(IpRange::builder().cidr_ip(cidr).build())
        }
        PermissionPeer::Group(group) => {
            builder.user_id_group_pairs(UserIdGroupPair::builder().group_id(group).build())
        }
    }
    .build()
}

fn is_ec2_code<E: ProvideErrorMetadata>(err: &E, code: &str) -> bool {
    err.code() == Some(code)
}

pub struct SecurityGroupManager<'a> {
    pub ec2: &'a aws_sdk_ec2::Client,
    pub vpc_id: &'a str,
    pub cluster_tag: &'a str,
}

impl SecurityGroupManager<'_> {
    async fn find_by_name(&self, name: &str) -> Result<Option<String>> {
        let out = self
            .ec2
            .describe_security_groups()
            .filters(Filter::builder().name("group-name").values(name).build())
            .filters(Filter::builder().name("vpc-id").values(self.vpc_id).build())
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
        Ok(out
            .security_groups()
            .first()
            .and_then(|sg| sg.group_id())
            .map(str::to_string))
    }

    async fn current_permissions(&self, sg_id: &str) -> Result<Vec<Permission>> {
        let out = self
            .ec2
            .describe_security_groups()
            .group_ids(sg_id)
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
        Ok(out
            .security_groups()
            .first()
            .map(|sg| expand_aws_permissions(sg.ip_permissions()))
            .unwrap_or_default())
    }

    /// Creates or finds the managed frontend SG and converges its inbound
    /// permissions. Returns the group ID.
    pub async fn ensure_frontend(&self, managed: &ManagedSecurityGroup) -> Result<(String, bool)> {
        let mut mutated = false;
        let sg_id = match self.find_by_name(&managed.name).await? {
            Some(id) => id,
            None => {
                info!(name = %managed.name, "creating managed security group");
                mutated = true;
                let tags: Vec<Tag> = managed
                    .tags
                    .iter()
                    .map(|(k, v)| Tag::builder().key(k).value(v).build())
                    .collect();
                let out = self
                    .ec2
                    .create_security_group()
                    .group_name(&managed.name)
                    .description("managed LB security group")
                    .vpc_id(self.vpc_id)
                    .tag_specifications(
                        TagSpecification::builder()
                            .resource_type(ResourceType::SecurityGroup)
                            .set_tags(Some(tags))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(aws_sdk_ec2::Error::from)?;
                out.group_id()
                    .ok_or_else(|| {
                        crate::error::Error::MissingDependency(format!(
                            "created security group {} has no id",
                            managed.name
                        ))
                    })?
                    .to_string()
            }
        };

        let desired = resolve_rules(&managed.ingress, &sg_id);
        let current = self.current_permissions(&sg_id).await?;
        mutated |= self.converge(&sg_id, &desired, &current).await?;
        Ok((sg_id, mutated))
    }

    /// Grants LB-to-target traffic on the cluster's node security groups.
    pub async fn ensure_backend_rules(
        &self,
        frontend_sg: &str,
        managed: &ManagedSecurityGroup,
    ) -> Result<bool> {
        if managed.target_ingress.is_empty() {
            return Ok(false);
        }
        let out = self
            .ec2
            .describe_security_groups()
            .filters(
                Filter::builder()
                    .name(format!("tag:{}", self.cluster_tag))
                    .values("owned")
                    .values("shared")
                    .build(),
            )
            .filters(Filter::builder().name("vpc-id").values(self.vpc_id).build())
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;

        let desired = resolve_rules(&managed.target_ingress, frontend_sg);
        let mut mutated = false;
        for sg in out.security_groups() {
            let Some(sg_id) = sg.group_id() else { continue };
            if sg_id == frontend_sg {
                continue;
            }
            // skip other controller-managed frontends
            if sg.tags().iter().any(|t| t.key() == Some(RESOURCE_TAG)) {
                continue;
            }
            let current = expand_aws_permissions(sg.ip_permissions());
            // only converge the permissions this controller owns: those
            // referencing the frontend SG
            let owned: Vec<Permission> = current
                .into_iter()
                .filter(|p| p.peer == PermissionPeer::Group(frontend_sg.to_string()))
                .collect();
            mutated |= self.converge(sg_id, &desired, &owned).await?;
        }
        Ok(mutated)
    }

    async fn converge(
        &self,
        sg_id: &str,
        desired: &[Permission],
        current: &[Permission],
    ) -> Result<bool> {
        let (authorize, revoke) = diff_permissions(desired, current);
        let mutated = !authorize.is_empty() || !revoke.is_empty();
        if !authorize.is_empty() {
            debug!(%sg_id, count = authorize.len(), "authorizing sg ingress");
            let result = self
                .ec2
                .authorize_security_group_ingress()
                .group_id(sg_id)
                .set_ip_permissions(Some(authorize.iter().map(to_ip_permission).collect()))
                .send()
                .await;
            if let Err(err) = &result {
                if !err
                    .as_service_error()
                    .is_some_and(|se| is_ec2_code(se, "InvalidPermission.Duplicate"))
                {
                    result.map_err(aws_sdk_ec2::Error::from)?;
                }
            }
        }
        if !revoke.is_empty() {
            debug!(%sg_id, count = revoke.len(), "revoking sg ingress");
            let result = self
                .ec2
                .revoke_security_group_ingress()
                .group_id(sg_id)
                .set_ip_permissions(Some(revoke.iter().map(to_ip_permission).collect()))
                .send()
                .await;
            if let Err(err) = &result {
                if !err
                    .as_service_error()
                    .is_some_and(|se| is_ec2_code(se, "InvalidPermission.NotFound"))
                {
                    result.map_err(aws_sdk_ec2::Error::from)?;
                }
            }
        }
        Ok(mutated)
    }

    /// Removes the managed frontend SG, revoking node-SG references first so
    /// the delete is not blocked by a dependency.
    pub async fn delete_frontend(&self, managed: &ManagedSecurityGroup) -> Result<()> {
        let Some(sg_id) = self.find_by_name(&managed.name).await? else {
            return Ok(());
        };
        // revoke every node-SG permission that references the frontend group
        let out = self
            .ec2
            .describe_security_groups()
            .filters(
                Filter::builder()
                    .name(format!("tag:{}", self.cluster_tag))
                    .values("owned")
                    .values("shared")
                    .build(),
            )
            .filters(Filter::builder().name("vpc-id").values(self.vpc_id).build())
            .send()
            .await
            .map_err(aws_sdk_ec2::Error::from)?;
        for sg in out.security_groups() {
            let Some(node_sg) = sg.group_id() else { continue };
            if node_sg == sg_id {
                continue;
            }
            let owned: Vec<Permission> = expand_aws_permissions(sg.ip_permissions())
                .into_iter()
                .filter(|p| p.peer == PermissionPeer::Group(sg_id.clone()))
                .collect();
            if !owned.is_empty() {
                self.converge(node_sg, &[], &owned).await?;
            }
        }

        info!(name = %managed.name, "deleting managed security group");
        match self
            .ec2
            .delete_security_group()
            .group_id(&sg_id)
            .send()
            .await
        {
            Ok(_) => Ok(()),
            Err(err)
                if err
                    .as_service_error()
                    .is_some_and(|se| is_ec2_code(se, "InvalidGroup.NotFound")) =>
            {
                Ok(())
            }
            Err(err) => Err(aws_sdk_ec2::Error::from(err).into()),
        }
    }
}
